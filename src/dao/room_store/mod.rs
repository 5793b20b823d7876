#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use crate::dao::models::{ChatMessageEntity, RoomEntity, SnapshotEntity};
use crate::dao::storage::StorageResult;
use futures::future::BoxFuture;

/// Number of chat messages kept by the backends for replay.
pub const PERSISTED_CHAT_LIMIT: usize = 500;

/// Abstraction over the persistence gateway for rooms, their chat history and snapshots.
pub trait RoomStore: Send + Sync {
    /// Stored room, or `None` when it does not exist.
    fn find_room(&self, id: String) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>>;
    /// Append a chat message, keeping the newest [`PERSISTED_CHAT_LIMIT`].
    fn append_message(
        &self,
        room_id: String,
        message: ChatMessageEntity,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Replace the code/input/output snapshot.
    fn save_snapshot(
        &self,
        room_id: String,
        snapshot: SnapshotEntity,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Remove a room. Returns whether it existed.
    fn delete_room(&self, room_id: String) -> BoxFuture<'static, StorageResult<bool>>;
    /// Check the backend is reachable.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the backend connection.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Keep only the newest [`PERSISTED_CHAT_LIMIT`] messages.
pub(crate) fn trim_history(messages: &mut Vec<ChatMessageEntity>) {
    if messages.len() > PERSISTED_CHAT_LIMIT {
        let overflow = messages.len() - PERSISTED_CHAT_LIMIT;
        messages.drain(..overflow);
    }
}
