//! MongoDB client, collection wrapper and keyset store

use async_trait::async_trait;
use bson::{doc, DateTime, Document};
use mongodb::{
    options::{IndexOptions, UpdateModifications},
    results::{DeleteResult, UpdateResult},
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info};

use crate::db::schemas::{KeysetDoc, KEYSET_COLLECTION};
use crate::db::store::{KeysetRecord, SessionKeyStore};
use crate::types::{AuthError, Result, UserId};

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and ping the database
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!(db = db_name, "Connecting to MongoDB");

        // Fail fast on an unreachable server
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| AuthError::Persistence(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| AuthError::Persistence(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes,
{
    /// Open a collection and apply its indexes
    pub async fn new(client: &Client, db_name: &str, collection_name: &str) -> Result<Self> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    async fn apply_indexes(&self) -> Result<()> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| AuthError::Persistence(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Find one document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| AuthError::Persistence(format!("Find failed: {}", e)))
    }

    /// Find many documents by filter, skipping any that fail to decode
    pub async fn find_many(&self, filter: Document) -> Result<Vec<T>> {
        use futures_util::StreamExt;

        let cursor = self
            .inner
            .find(filter)
            .await
            .map_err(|e| AuthError::Persistence(format!("Find failed: {}", e)))?;

        let results: Vec<T> = cursor
            .filter_map(|doc| async {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    /// Update one document, inserting it if no document matches
    pub async fn upsert_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
    ) -> Result<UpdateResult> {
        self.inner
            .update_one(filter, update.into())
            .upsert(true)
            .await
            .map_err(|e| AuthError::Persistence(format!("Upsert failed: {}", e)))
    }

    /// Permanently delete one document
    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        self.inner
            .delete_one(filter)
            .await
            .map_err(|e| AuthError::Persistence(format!("Delete failed: {}", e)))
    }
}

// =============================================================================
// Keyset Store
// =============================================================================

/// [`SessionKeyStore`] backed by the `user_keysets` collection.
#[derive(Debug, Clone)]
pub struct MongoKeysetStore {
    collection: MongoCollection<KeysetDoc>,
}

impl MongoKeysetStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        let collection = client.collection::<KeysetDoc>(KEYSET_COLLECTION).await?;
        Ok(Self { collection })
    }
}

#[async_trait]
impl SessionKeyStore for MongoKeysetStore {
    async fn save(&self, user_id: UserId, key_data: &str) -> Result<()> {
        let now = DateTime::now();
        let update = doc! {
            "$set": {
                "key_data": key_data,
                "metadata.updated_at": now,
            },
            "$setOnInsert": {
                "metadata.created_at": now,
            },
        };

        let result = self
            .collection
            .upsert_one(KeysetDoc::user_filter(user_id)?, update)
            .await?;

        debug!(
            user_id,
            inserted = result.upserted_id.is_some(),
            "Saved keyset"
        );
        Ok(())
    }

    async fn load(&self, user_id: UserId) -> Result<KeysetRecord> {
        self.collection
            .find_one(KeysetDoc::user_filter(user_id)?)
            .await?
            .ok_or_else(|| AuthError::NotFound(format!("keyset for user {user_id}")))?
            .into_record()
    }

    async fn delete(&self, user_id: UserId) -> Result<()> {
        let result = self
            .collection
            .delete_one(KeysetDoc::user_filter(user_id)?)
            .await?;

        if result.deleted_count == 0 {
            return Err(AuthError::NotFound(format!("keyset for user {user_id}")));
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<KeysetRecord>> {
        let docs = self.collection.find_many(doc! {}).await?;

        let mut records = Vec::with_capacity(docs.len());
        for doc in docs {
            match doc.into_record() {
                Ok(record) => records.push(record),
                Err(e) => error!("Skipping keyset document: {}", e),
            }
        }
        Ok(records)
    }
}
