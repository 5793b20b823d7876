use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};

use crate::dao::models::{
    ChatKindEntity, ChatMessageEntity, MemberEntity, RoomEntity, SnapshotEntity,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoRoomDocument {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    owner_id: String,
    #[serde(default)]
    members: Vec<MongoMemberDocument>,
    #[serde(default)]
    snapshot: Option<MongoSnapshotDocument>,
    #[serde(default)]
    messages: Vec<MongoChatMessageDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoMemberDocument {
    member_id: String,
    joined_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoSnapshotDocument {
    code: String,
    language: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    show_output: bool,
    updated_by: Option<String>,
    updated_at: Option<DateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoChatMessageDocument {
    id: String,
    author_id: String,
    author_name: String,
    body: String,
    kind: ChatKindEntity,
    sent_at: DateTime,
}

impl From<MongoRoomDocument> for RoomEntity {
    fn from(value: MongoRoomDocument) -> Self {
        Self {
            id: value.id,
            name: value.name,
            owner_id: value.owner_id,
            members: value
                .members
                .into_iter()
                .map(|member| MemberEntity {
                    member_id: member.member_id,
                    joined_at: member.joined_at.to_system_time(),
                })
                .collect(),
            snapshot: value
                .snapshot
                .map(|snapshot| SnapshotEntity {
                    code: snapshot.code,
                    language: snapshot.language,
                    input: snapshot.input,
                    output: snapshot.output,
                    show_output: snapshot.show_output,
                    updated_by: snapshot.updated_by,
                    updated_at: snapshot.updated_at.map(|at| at.to_system_time()),
                })
                .unwrap_or_default(),
            messages: value
                .messages
                .into_iter()
                .map(|message| ChatMessageEntity {
                    id: message.id,
                    author_id: message.author_id,
                    author_name: message.author_name,
                    body: message.body,
                    kind: message.kind,
                    sent_at: message.sent_at.to_system_time(),
                })
                .collect(),
        }
    }
}

fn kind_as_str(kind: ChatKindEntity) -> &'static str {
    match kind {
        ChatKindEntity::Message => "message",
        ChatKindEntity::System => "system",
    }
}

/// BSON form of a chat message, used inside `$push` updates.
pub fn message_document(message: &ChatMessageEntity) -> Document {
    doc! {
        "id": &message.id,
        "author_id": &message.author_id,
        "author_name": &message.author_name,
        "body": &message.body,
        "kind": kind_as_str(message.kind),
        "sent_at": DateTime::from_system_time(message.sent_at),
    }
}

/// BSON form of a room snapshot, used inside `$set` updates.
pub fn snapshot_document(snapshot: &SnapshotEntity) -> Document {
    doc! {
        "code": &snapshot.code,
        "language": &snapshot.language,
        "input": &snapshot.input,
        "output": &snapshot.output,
        "show_output": snapshot.show_output,
        "updated_by": snapshot.updated_by.clone(),
        "updated_at": snapshot.updated_at.map(DateTime::from_system_time),
    }
}

pub fn doc_id(id: &str) -> Document {
    doc! {"_id": id}
}
