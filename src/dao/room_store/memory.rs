//! Process-local room store used when no database is configured and by tests.

use std::{fs, io, path::Path, sync::Arc};

use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;

use super::{RoomStore, trim_history};
use crate::dao::{
    models::{ChatMessageEntity, RoomEntity, SnapshotEntity},
    storage::{StorageError, StorageResult},
};

/// Failures raised while seeding the memory store from disk.
#[derive(Debug, Error)]
pub enum SeedError {
    /// The seed file could not be read.
    #[error("failed to read room seed file")]
    Read(#[source] io::Error),
    /// The seed file is not a JSON array of rooms.
    #[error("failed to parse room seed file")]
    Parse(#[source] serde_json::Error),
}

#[derive(Debug, Error)]
#[error("room `{0}` does not exist")]
struct MissingRoom(String);

/// Room store keeping every document in a concurrent map.
#[derive(Clone, Default)]
pub struct MemoryRoomStore {
    rooms: Arc<DashMap<String, RoomEntity>>,
}

impl MemoryRoomStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated from a JSON array of [`RoomEntity`].
    pub fn from_seed_file(path: &Path) -> Result<Self, SeedError> {
        let contents = fs::read_to_string(path).map_err(SeedError::Read)?;
        let rooms: Vec<RoomEntity> = serde_json::from_str(&contents).map_err(SeedError::Parse)?;
        let store = Self::new();
        for room in rooms {
            store.insert_room(room);
        }
        Ok(store)
    }

    /// Insert or replace a room document.
    pub fn insert_room(&self, room: RoomEntity) {
        self.rooms.insert(room.id.clone(), room);
    }

    /// Return a copy of a stored room document.
    pub fn room(&self, id: &str) -> Option<RoomEntity> {
        self.rooms.get(id).map(|entry| entry.value().clone())
    }
}

impl RoomStore for MemoryRoomStore {
    fn find_room(&self, id: String) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let room = self.room(&id);
        Box::pin(async move { Ok(room) })
    }

    fn append_message(
        &self,
        room_id: String,
        message: ChatMessageEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let result = match self.rooms.get_mut(&room_id) {
            Some(mut room) => {
                room.messages.push(message);
                trim_history(&mut room.messages);
                Ok(())
            }
            None => Err(StorageError::unavailable(
                "append chat message".into(),
                MissingRoom(room_id),
            )),
        };
        Box::pin(async move { result })
    }

    fn save_snapshot(
        &self,
        room_id: String,
        snapshot: SnapshotEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let result = match self.rooms.get_mut(&room_id) {
            Some(mut room) => {
                room.snapshot = snapshot;
                Ok(())
            }
            None => Err(StorageError::unavailable(
                "save room snapshot".into(),
                MissingRoom(room_id),
            )),
        };
        Box::pin(async move { result })
    }

    fn delete_room(&self, room_id: String) -> BoxFuture<'static, StorageResult<bool>> {
        let removed = self.rooms.remove(&room_id).is_some();
        Box::pin(async move { Ok(removed) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::dao::{
        models::{ChatKindEntity, MemberEntity},
        room_store::PERSISTED_CHAT_LIMIT,
    };

    fn room(id: &str) -> RoomEntity {
        RoomEntity {
            id: id.into(),
            name: "pairing".into(),
            owner_id: "alice".into(),
            members: vec![MemberEntity {
                member_id: "alice".into(),
                joined_at: SystemTime::now(),
            }],
            snapshot: SnapshotEntity::default(),
            messages: Vec::new(),
        }
    }

    fn message(n: usize) -> ChatMessageEntity {
        ChatMessageEntity {
            id: format!("m{n}"),
            author_id: "alice".into(),
            author_name: "Alice".into(),
            body: format!("hello {n}"),
            kind: ChatKindEntity::Message,
            sent_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn persisted_history_is_trimmed_to_the_newest_messages() {
        let store = MemoryRoomStore::new();
        store.insert_room(room("r1"));

        for n in 0..PERSISTED_CHAT_LIMIT + 3 {
            store.append_message("r1".into(), message(n)).await.unwrap();
        }

        let stored = store.find_room("r1".into()).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), PERSISTED_CHAT_LIMIT);
        assert_eq!(stored.messages[0].id, "m3");
    }

    #[tokio::test]
    async fn writes_to_unknown_rooms_fail() {
        let store = MemoryRoomStore::new();
        let err = store
            .save_snapshot("ghost".into(), SnapshotEntity::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("save room snapshot"));
    }

    #[tokio::test]
    async fn delete_reports_whether_a_room_existed() {
        let store = MemoryRoomStore::new();
        store.insert_room(room("r1"));
        assert!(store.delete_room("r1".into()).await.unwrap());
        assert!(!store.delete_room("r1".into()).await.unwrap());
        assert!(store.find_room("r1".into()).await.unwrap().is_none());
    }
}
