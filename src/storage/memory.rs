//! A volatile [`EmbeddingStorage`] for tests and local runs without Redis.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
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

#[derive(Debug)]
struct Inner {
    embeddings: HashMap<Uuid, EmbeddingRecord>,
    artifacts: HashMap<ArtifactKind, TrustedSetupArtifact>,
    ready: bool,
}

#[derive(Clone, Debug)]
pub struct InMemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                embeddings: HashMap::new(),
                artifacts: HashMap::new(),
                ready: true,
            })),
        }
    }

    /// Makes [`EmbeddingStorage::is_ready`] fail until set back to `true`.
    pub async fn set_ready(&self, ready: bool) {
        self.inner.lock().await.ready = ready;
    }

    /// Number of stored templates.
    pub async fn embedding_count(&self) -> usize {
        self.inner.lock().await.embeddings.len()
    }
}

#[async_trait]
impl EmbeddingStorage for InMemoryStorage {
    async fn put_embedding(&mut self, package: &EncryptedPackage) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        let record = EmbeddingRecord {
            id,
            encrypted_data: package.data.clone(),
            iv: package.iv.clone(),
            created_at: Utc::now(),
        };
        self.inner.lock().await.embeddings.insert(id, record);
        Ok(id)
    }

    async fn embedding(&mut self, id: &str) -> StorageResult<Option<EmbeddingRecord>> {
        let id = match Uuid::parse_str(id) {
            Ok(id) => id,
            Err(_) => return Ok(None),
        };
        Ok(self.inner.lock().await.embeddings.get(&id).cloned())
    }

    async fn put_artifact(&mut self, kind: ArtifactKind, content: &str) -> StorageResult<()> {
        let artifact = TrustedSetupArtifact {
            kind,
            content: content.to_string(),
            updated_at: Utc::now(),
        };
        self.inner.lock().await.artifacts.insert(kind, artifact);
        Ok(())
    }

    async fn artifact(
        &mut self,
        kind: ArtifactKind,
    ) -> StorageResult<Option<TrustedSetupArtifact>> {
        Ok(self.inner.lock().await.artifacts.get(&kind).cloned())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        if self.inner.lock().await.ready {
            Ok(())
        } else {
            Err(anyhow::anyhow!("in-memory store is not ready"))
        }
    }
}
