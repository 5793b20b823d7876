use std::{sync::Arc, time::SystemTime};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, info, warn};

use crate::{
    dao::models::RoomEntity,
    error::ServiceError,
    state::{
        ClientConnection, StoreSlot,
        actor::{self, RoomHandle, RoomOp},
        room::{Room, RoomSettings},
    },
};

/// Attempts at joining a room whose actor unloads concurrently.
const JOIN_ATTEMPTS: usize = 3;

/// Live room handles and tombstones of ended rooms, shared with the room actors.
///
/// A tombstone keeps an ended room from being loaded again until its deletion reaches storage.
#[derive(Clone, Default)]
pub struct RoomDirectory {
    rooms: Arc<DashMap<String, RoomHandle>>,
    ended: Arc<DashMap<String, SystemTime>>,
}

impl RoomDirectory {
    /// Tombstone an ended room and drop its handle.
    pub fn mark_ended(&self, room_id: &str) {
        self.ended.insert(room_id.to_string(), SystemTime::now());
        if self.rooms.remove(room_id).is_some() {
            info!(room = %room_id, "room evicted from registry");
        }
    }

    /// Drop the tombstone of a room whose deletion was persisted.
    pub fn forget_ended(&self, room_id: &str) {
        self.ended.remove(room_id);
    }

    /// Drop the handle of an unloaded room, unless a fresh actor already replaced it.
    pub fn evict(&self, room_id: &str) {
        if self
            .rooms
            .remove_if(room_id, |_, handle| handle.is_closed())
            .is_some()
        {
            info!(room = %room_id, "idle room unloaded");
        }
    }

    fn is_ended(&self, room_id: &str) -> bool {
        self.ended.contains_key(room_id)
    }

    fn live(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }
}

/// Live rooms keyed by identifier, loaded lazily from storage.
///
/// Each live room runs its own actor, which unloads itself once nobody is present.
pub struct RoomRegistry {
    directory: RoomDirectory,
    settings: RoomSettings,
    store: StoreSlot,
}

impl RoomRegistry {
    /// Create an empty registry reading rooms from `store`.
    pub fn new(settings: RoomSettings, store: StoreSlot) -> Self {
        Self {
            directory: RoomDirectory::default(),
            settings,
            store,
        }
    }

    /// Handle of a room that is already live.
    ///
    /// Operations other than join only make sense on a live room; an unknown room therefore
    /// means the caller never joined it.
    pub fn get(&self, room_id: &str) -> Result<RoomHandle, ServiceError> {
        if self.directory.is_ended(room_id) {
            return Err(ServiceError::RoomNotFound(room_id.to_string()));
        }
        self.directory.live(room_id).ok_or(ServiceError::NotActive)
    }

    /// Join `room_id` on behalf of `from`.
    ///
    /// Membership is checked against a fresh read of the stored room, so members removed from it
    /// and rooms deleted from storage are refused even while the room is live. Returns the handle
    /// when the join succeeded and `None` when the room refused it; the room actor acknowledges
    /// both. Errors raised before reaching a room are returned unacknowledged.
    pub async fn join(
        &self,
        room_id: &str,
        from: &ClientConnection,
        request_id: Option<u64>,
    ) -> Result<Option<RoomHandle>, ServiceError> {
        for _ in 0..JOIN_ATTEMPTS {
            let (handle, refreshed) = self.open(room_id).await?;
            match handle
                .try_request(from, request_id, RoomOp::Join { refreshed })
                .await
            {
                Some(Ok(_)) => return Ok(Some(handle)),
                Some(Err(_)) => return Ok(None),
                None => debug!(room = %room_id, "room unloaded while joining; reopening"),
            }
        }
        Err(ServiceError::RoomNotFound(room_id.to_string()))
    }

    /// Handle of a room plus the stored copy to refresh it with, starting its actor if needed.
    ///
    /// A live room is kept on its cached membership when storage cannot be read.
    async fn open(&self, room_id: &str) -> Result<(RoomHandle, Option<RoomEntity>), ServiceError> {
        if self.directory.is_ended(room_id) {
            return Err(ServiceError::RoomNotFound(room_id.to_string()));
        }

        let stored = self.load(room_id).await;
        let entity = match (self.directory.live(room_id), stored) {
            (_, Err(err @ ServiceError::RoomNotFound(_))) => return Err(err),
            (Some(handle), Ok(entity)) => return Ok((handle, Some(entity))),
            (Some(handle), Err(err)) => {
                warn!(room = %room_id, error = %err, "could not re-read room; using cached membership");
                return Ok((handle, None));
            }
            (None, Err(err)) => return Err(err),
            (None, Ok(entity)) => entity,
        };

        // The map entry lock is held only for the synchronous spawn below.
        match self.directory.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                Ok((entry.get().clone(), Some(entity)))
            }
            _ if self.directory.is_ended(room_id) => {
                Err(ServiceError::RoomNotFound(room_id.to_string()))
            }
            Entry::Occupied(mut entry) => {
                let handle = self.start(entity);
                entry.insert(handle.clone());
                Ok((handle, None))
            }
            Entry::Vacant(entry) => {
                let handle = self.start(entity);
                entry.insert(handle.clone());
                Ok((handle, None))
            }
        }
    }

    /// Fetch the stored copy of a room.
    async fn load(&self, room_id: &str) -> Result<RoomEntity, ServiceError> {
        let store = self.store.get().await.ok_or(ServiceError::Degraded)?;
        store
            .find_room(room_id.to_string())
            .await?
            .ok_or_else(|| ServiceError::RoomNotFound(room_id.to_string()))
    }

    /// Number of live rooms.
    pub fn len(&self) -> usize {
        self.directory.rooms.len()
    }

    /// Whether no room is live.
    pub fn is_empty(&self) -> bool {
        self.directory.rooms.is_empty()
    }

    fn start(&self, entity: RoomEntity) -> RoomHandle {
        let room = Room::from_entity(entity, &self.settings);
        info!(room = %room.id(), "room loaded");
        actor::spawn(room, self.store.clone(), self.directory.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        dao::{
            models::{MemberEntity, SnapshotEntity},
            room_store::{RoomStore, memory::MemoryRoomStore},
        },
        services::identity::Identity,
    };

    fn stored_room(id: &str) -> RoomEntity {
        RoomEntity {
            id: id.into(),
            name: "pairing".into(),
            owner_id: "a".into(),
            members: vec![MemberEntity {
                member_id: "a".into(),
                joined_at: SystemTime::now(),
            }],
            snapshot: SnapshotEntity::default(),
            messages: Vec::new(),
        }
    }

    async fn registry_with(rooms: &[&str]) -> (RoomRegistry, Arc<MemoryRoomStore>) {
        let memory = Arc::new(MemoryRoomStore::new());
        for id in rooms {
            memory.insert_room(stored_room(id));
        }
        let slot = StoreSlot::default();
        slot.set(Some(memory.clone() as Arc<dyn RoomStore>)).await;
        (RoomRegistry::new(RoomSettings::default(), slot), memory)
    }

    fn connection(member: &str) -> (ClientConnection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ClientConnection {
            id: Uuid::new_v4(),
            identity: Identity {
                member_id: member.into(),
                display_name: member.to_uppercase(),
            },
            tx,
        };
        (connection, rx)
    }

    #[tokio::test]
    async fn rooms_load_once() {
        let (registry, _) = registry_with(&["r1"]).await;
        let (first, fresh) = registry.open("r1").await.unwrap();
        assert!(fresh.is_none());
        let (second, refreshed) = registry.open("r1").await.unwrap();
        assert_eq!(first.room_id(), second.room_id());
        assert!(refreshed.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unknown_rooms_are_not_found() {
        let (registry, _) = registry_with(&[]).await;
        let (a, _rx) = connection("a");
        assert!(matches!(
            registry.join("ghost", &a, None).await,
            Err(ServiceError::RoomNotFound(_))
        ));
        assert!(matches!(registry.get("ghost"), Err(ServiceError::NotActive)));
    }

    #[tokio::test]
    async fn loading_without_storage_is_degraded() {
        let registry = RoomRegistry::new(RoomSettings::default(), StoreSlot::default());
        let (a, _rx) = connection("a");
        assert!(matches!(
            registry.join("r1", &a, None).await,
            Err(ServiceError::Degraded)
        ));
    }

    #[tokio::test]
    async fn ended_rooms_cannot_be_reloaded() {
        let (registry, _) = registry_with(&["r1"]).await;
        registry.open("r1").await.unwrap();
        registry.directory.mark_ended("r1");

        assert!(registry.is_empty());
        let (a, _rx) = connection("a");
        assert!(matches!(
            registry.join("r1", &a, None).await,
            Err(ServiceError::RoomNotFound(_))
        ));
        assert!(matches!(registry.get("r1"), Err(ServiceError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn rooms_deleted_from_storage_refuse_joins() {
        let (registry, store) = registry_with(&["r1"]).await;
        let (a, _rx) = connection("a");
        assert!(registry.join("r1", &a, None).await.unwrap().is_some());

        store.delete_room("r1".into()).await.unwrap();
        let (again, _again_rx) = connection("a");
        assert!(matches!(
            registry.join("r1", &again, None).await,
            Err(ServiceError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn idle_rooms_unload_and_reload() {
        let (registry, _) = registry_with(&["r1"]).await;
        let (a, _rx) = connection("a");
        let handle = registry.join("r1", &a, None).await.unwrap().unwrap();
        assert_eq!(registry.len(), 1);

        handle.request(&a, None, RoomOp::Leave).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !registry.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(handle.is_closed());

        assert!(registry.join("r1", &a, None).await.unwrap().is_some());
        assert_eq!(registry.len(), 1);
    }
}
