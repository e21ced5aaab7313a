//! A Redis compatible [`EmbeddingStorage`].
//!
//! # Redis Data Model
//!
//!```text
//! {
//!     // one hash per template
//!     "embedding:<uuid>": {
//!         "encrypted_data": "...", // base64
//!         "iv": "...",             // base64
//!         "created_at": "..."      // RFC 3339
//!     },
//!     // one hash per artifact kind
//!     "trusted_setup:verification_key": {
//!         "file_content": "...",   // JSON text
//!         "updated_at": "..."
//!     },
//!     "trusted_setup:proving_key": { ... }, // base64
//!     "trusted_setup:circuit": { ... }      // base64
//! }
//! ```

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, IntoConnectionInfo};
pub use redis::{RedisError, RedisResult};
use tracing::debug;
use uuid::Uuid;

use crate::{
    message::EncryptedPackage,
    storage::{
        ArtifactKind,
        EmbeddingRecord,
        EmbeddingStorage,
        StorageResult,
        TrustedSetupArtifact,
    },
};

#[derive(Clone)]
pub struct Client {
    connection: ConnectionManager,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redis client").finish()
    }
}

fn embedding_key(id: &Uuid) -> String {
    format!("embedding:{}", id)
}

fn artifact_key(kind: ArtifactKind) -> String {
    format!("trusted_setup:{}", kind)
}

fn field(fields: &mut HashMap<String, String>, name: &str, key: &str) -> StorageResult<String> {
    fields
        .remove(name)
        .ok_or_else(|| anyhow!("corrupt entry {}: missing field `{}`", key, name))
}

fn timestamp(value: &str, key: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("corrupt entry {}: invalid timestamp", key))
}

impl Client {
    /// Creates a new Redis client.
    ///
    /// `url` to which Redis instance the client should connect to.
    /// The URL format is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// The [`Client`] uses a [`redis::aio::ConnectionManager`] that automatically reconnects
    /// if the connection is dropped.
    pub async fn new<T: IntoConnectionInfo>(url: T) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_tokio_connection_manager().await?;
        Ok(Self { connection })
    }

    /// Deletes all data in the current database.
    pub async fn flush_db(&mut self) -> RedisResult<()> {
        debug!("flush current database");
        // https://redis.io/commands/flushdb
        // > This command never fails.
        redis::cmd("FLUSHDB")
            .arg("ASYNC")
            .query_async(&mut self.connection)
            .await
    }
}

#[async_trait]
impl EmbeddingStorage for Client {
    async fn put_embedding(&mut self, package: &EncryptedPackage) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        let key = embedding_key(&id);
        let created_at = Utc::now().to_rfc3339();
        debug!("store template {}", key);
        // https://redis.io/commands/hset
        // all fields are written in one transaction, so a record is never partially visible
        redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("encrypted_data", package.data.as_str()),
                    ("iv", package.iv.as_str()),
                    ("created_at", created_at.as_str()),
                ],
            )
            .ignore()
            .query_async::<_, ()>(&mut self.connection)
            .await?;
        Ok(id)
    }

    async fn embedding(&mut self, id: &str) -> StorageResult<Option<EmbeddingRecord>> {
        let id = match Uuid::parse_str(id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        let key = embedding_key(&id);
        // https://redis.io/commands/hgetall
        // > Return value
        //   Array reply: list of fields and their values stored in the hash, or an empty
        //   list when key does not exist.
        let mut fields: HashMap<String, String> = self.connection.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let created_at = field(&mut fields, "created_at", &key)?;
        Ok(Some(EmbeddingRecord {
            id,
            encrypted_data: field(&mut fields, "encrypted_data", &key)?,
            iv: field(&mut fields, "iv", &key)?,
            created_at: timestamp(&created_at, &key)?,
        }))
    }

    async fn put_artifact(&mut self, kind: ArtifactKind, content: &str) -> StorageResult<()> {
        let key = artifact_key(kind);
        let updated_at = Utc::now().to_rfc3339();
        debug!("store {} ({} bytes)", key, content.len());
        // HSET overwrites existing fields, which gives upsert-by-kind
        redis::pipe()
            .atomic()
            .hset_multiple(
                &key,
                &[
                    ("file_content", content),
                    ("updated_at", updated_at.as_str()),
                ],
            )
            .ignore()
            .query_async::<_, ()>(&mut self.connection)
            .await?;
        Ok(())
    }

    async fn artifact(
        &mut self,
        kind: ArtifactKind,
    ) -> StorageResult<Option<TrustedSetupArtifact>> {
        let key = artifact_key(kind);
        let mut fields: HashMap<String, String> = self.connection.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let updated_at = field(&mut fields, "updated_at", &key)?;
        Ok(Some(TrustedSetupArtifact {
            kind,
            content: field(&mut fields, "file_content", &key)?,
            updated_at: timestamp(&updated_at, &key)?,
        }))
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        // https://redis.io/commands/ping
        redis::cmd("PING")
            .query_async(&mut self.connection)
            .await
            .map_err(From::from)
    }
}
