/// Per-room actor tasks.
pub mod actor;
/// Bounded chat history.
pub mod chat;
/// Unanimous approval gate for program runs.
pub mod execution;
/// Connections present in a room.
pub mod presence;
/// Live rooms and tombstones.
pub mod registry;
/// Pure room state.
pub mod room;

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{RwLock, mpsc, watch};

use crate::{
    config::AppConfig,
    dao::room_store::RoomStore,
    dto::ws::ServerMessage,
    error::ServiceError,
    services::{
        identity::{Identity, IdentityVerifier},
        sandbox::SandboxClient,
        websocket_service::send_message_to_websocket,
    },
};

use self::{presence::ConnectionId, registry::RoomRegistry, room::RoomSettings};

/// Application state shared by every handler and socket task.
pub type SharedState = Arc<AppState>;

#[derive(Clone)]
/// Authenticated socket and the channel feeding its writer task.
pub struct ClientConnection {
    /// Identifier assigned when the socket authenticated.
    pub id: ConnectionId,
    /// Member behind the socket.
    pub identity: Identity,
    /// Outbound queue drained by the writer task.
    pub tx: mpsc::UnboundedSender<Message>,
}

impl ClientConnection {
    /// Queue `message` for this socket. Returns `false` once the socket is gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        send_message_to_websocket(&self.tx, message).is_ok()
    }
}

/// Shared slot holding the storage backend, empty while in degraded mode.
#[derive(Clone, Default)]
pub struct StoreSlot(Arc<RwLock<Option<Arc<dyn RoomStore>>>>);

impl StoreSlot {
    /// Current backend, if one is installed.
    pub async fn get(&self) -> Option<Arc<dyn RoomStore>> {
        self.0.read().await.as_ref().cloned()
    }

    async fn set(&self, store: Option<Arc<dyn RoomStore>>) {
        *self.0.write().await = store;
    }
}

/// Central application state: configuration, collaborators and the room registry.
pub struct AppState {
    config: Arc<AppConfig>,
    store: StoreSlot,
    degraded: watch::Sender<bool>,
    registry: RoomRegistry,
    identity: Arc<dyn IdentityVerifier>,
    sandbox: Arc<dyn SandboxClient>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(
        config: AppConfig,
        identity: Arc<dyn IdentityVerifier>,
        sandbox: Arc<dyn SandboxClient>,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let store = StoreSlot::default();
        let settings = RoomSettings {
            chat_capacity: config.chat_capacity,
            execution_ttl: config.execution_request_ttl,
        };

        Arc::new(Self {
            config: Arc::new(config),
            registry: RoomRegistry::new(settings, store.clone()),
            store,
            degraded: degraded_tx,
            identity,
            sandbox,
        })
    }

    /// Shared runtime configuration.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.clone()
    }

    /// Obtain a handle to the current room store, if one is installed.
    pub async fn room_store(&self) -> Option<Arc<dyn RoomStore>> {
        self.store.get().await
    }

    /// Current room store, or [`ServiceError::Degraded`].
    pub async fn require_room_store(&self) -> Result<Arc<dyn RoomStore>, ServiceError> {
        self.room_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new room store implementation and leave degraded mode.
    pub async fn set_room_store(&self, store: Arc<dyn RoomStore>) {
        self.store.set(Some(store)).await;
        self.update_degraded(false).await;
    }

    /// Remove the current room store and enter degraded mode.
    pub async fn clear_room_store(&self) {
        self.store.set(None).await;
        self.update_degraded(true).await;
    }

    /// Current degraded flag.
    pub async fn is_degraded(&self) -> bool {
        *self.degraded.borrow() || self.store.get().await.is_none()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update the degraded flag, notifying watchers when the value changes.
    pub async fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Live rooms.
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Identity verification collaborator.
    pub fn identity(&self) -> Arc<dyn IdentityVerifier> {
        self.identity.clone()
    }

    /// Execution sandbox collaborator.
    pub fn sandbox(&self) -> Arc<dyn SandboxClient> {
        self.sandbox.clone()
    }
}
