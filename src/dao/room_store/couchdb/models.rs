use serde::{Deserialize, Serialize};

use crate::dao::models::RoomEntity;

pub const ROOM_PREFIX: &str = "room::";

/// Room document stored under `room::<id>` with CouchDB revision bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchRoomDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub room: RoomEntity,
}

impl CouchRoomDocument {
    pub fn into_entity(self) -> RoomEntity {
        self.room
    }
}

pub fn room_doc_id(id: &str) -> String {
    format!("{ROOM_PREFIX}{id}")
}
