use std::sync::Arc;

use futures::future::BoxFuture;
use mongodb::{Client, Collection, Database, bson::doc, options::IndexOptions};
use tokio::sync::RwLock;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{MongoRoomDocument, doc_id, message_document, snapshot_document},
};
use crate::dao::{
    models::{ChatMessageEntity, RoomEntity, SnapshotEntity},
    room_store::{PERSISTED_CHAT_LIMIT, RoomStore},
    storage::StorageResult,
};

const ROOM_COLLECTION_NAME: &str = "rooms";

#[derive(Clone)]
pub struct MongoRoomStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoRoomStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let collection = self.collection().await;
        let index = mongodb::IndexModel::builder()
            .keys(doc! {"members.member_id": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("room_member_idx".to_owned()))
                    .build(),
            )
            .build();

        collection
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: ROOM_COLLECTION_NAME,
                index: "members.member_id",
                source,
            })?;

        Ok(())
    }

    async fn collection(&self) -> Collection<MongoRoomDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoRoomDocument>(ROOM_COLLECTION_NAME)
    }

    async fn find_room(&self, id: String) -> MongoResult<Option<RoomEntity>> {
        let collection = self.collection().await;
        let document = collection
            .find_one(doc_id(&id))
            .await
            .map_err(|source| MongoDaoError::LoadRoom { id, source })?;
        Ok(document.map(Into::into))
    }

    async fn append_message(&self, id: String, message: ChatMessageEntity) -> MongoResult<()> {
        let collection = self.collection().await;
        let limit = -(PERSISTED_CHAT_LIMIT as i64);
        collection
            .update_one(
                doc_id(&id),
                doc! {
                    "$push": {
                        "messages": {
                            "$each": [message_document(&message)],
                            "$slice": limit,
                        }
                    }
                },
            )
            .await
            .map_err(|source| MongoDaoError::AppendMessage { id, source })?;
        Ok(())
    }

    async fn save_snapshot(&self, id: String, snapshot: SnapshotEntity) -> MongoResult<()> {
        let collection = self.collection().await;
        collection
            .update_one(
                doc_id(&id),
                doc! { "$set": { "snapshot": snapshot_document(&snapshot) } },
            )
            .await
            .map_err(|source| MongoDaoError::SaveSnapshot { id, source })?;
        Ok(())
    }

    async fn delete_room(&self, id: String) -> MongoResult<bool> {
        let collection = self.collection().await;
        let result = collection
            .delete_one(doc_id(&id))
            .await
            .map_err(|source| MongoDaoError::DeleteRoom { id, source })?;
        Ok(result.deleted_count > 0)
    }
}

impl RoomStore for MongoRoomStore {
    fn find_room(&self, id: String) -> BoxFuture<'static, StorageResult<Option<RoomEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_room(id).await.map_err(Into::into) })
    }

    fn append_message(
        &self,
        room_id: String,
        message: ChatMessageEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .append_message(room_id, message)
                .await
                .map_err(Into::into)
        })
    }

    fn save_snapshot(
        &self,
        room_id: String,
        snapshot: SnapshotEntity,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .save_snapshot(room_id, snapshot)
                .await
                .map_err(Into::into)
        })
    }

    fn delete_room(&self, room_id: String) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.delete_room(room_id).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
