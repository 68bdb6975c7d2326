//! User keyset document schema
//!
//! One document per user holding the serialized JWK Set of all device keys.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;
use crate::db::store::KeysetRecord;
use crate::types::{AuthError, Result, UserId};

/// Collection name for user keysets
pub const KEYSET_COLLECTION: &str = "user_keysets";

/// Keyset document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct KeysetDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata
    #[serde(default)]
    pub metadata: Metadata,

    /// Owning user (BSON has no unsigned 64-bit integer)
    pub user_id: i64,

    /// Serialized JWK Set, possibly sealed
    pub key_data: String,
}

impl KeysetDoc {
    /// Filter matching one user's document
    pub fn user_filter(user_id: UserId) -> Result<Document> {
        Ok(doc! { "user_id": Self::bson_user_id(user_id)? })
    }

    pub fn bson_user_id(user_id: UserId) -> Result<i64> {
        i64::try_from(user_id)
            .map_err(|_| AuthError::InvalidInput(format!("user id {user_id} is out of range")))
    }

    /// Convert into the store-level record.
    pub fn into_record(self) -> Result<KeysetRecord> {
        let user_id = UserId::try_from(self.user_id).map_err(|_| {
            AuthError::Persistence(format!("negative user id {} in keyset", self.user_id))
        })?;

        let created_at = self
            .metadata
            .created_at
            .map(|t| t.to_chrono())
            .unwrap_or_default();
        let updated_at = self
            .metadata
            .updated_at
            .map(|t| t.to_chrono())
            .unwrap_or(created_at);

        Ok(KeysetRecord {
            user_id,
            key_data: self.key_data,
            created_at,
            updated_at,
        })
    }
}

impl IntoIndexes for KeysetDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // One keyset per user
            (
                doc! { "user_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("user_id_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}
