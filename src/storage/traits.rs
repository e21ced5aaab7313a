//! Storage API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use uuid::Uuid;

use crate::message::EncryptedPackage;

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, connection refused, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// The kind of a trusted setup artifact. There is at most one artifact per kind.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum ArtifactKind {
    #[display(fmt = "verification_key")]
    VerificationKey,
    #[display(fmt = "proving_key")]
    ProvingKey,
    #[display(fmt = "circuit")]
    Circuit,
}

/// An encrypted biometric template as stored by the server.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub encrypted_data: String,
    pub iv: String,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn package(&self) -> EncryptedPackage {
        EncryptedPackage {
            data: self.encrypted_data.clone(),
            iv: self.iv.clone(),
        }
    }
}

/// A stored trusted setup artifact. Binary artifacts are base64 encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct TrustedSetupArtifact {
    pub kind: ArtifactKind,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
/// The custody store of the server.
pub trait EmbeddingStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Stores an encrypted template under a freshly generated id and returns the id.
    ///
    /// # Behavior
    ///
    /// - Every call creates a new record, even if the same package was stored before.
    async fn put_embedding(&mut self, package: &EncryptedPackage) -> StorageResult<Uuid>;

    /// Returns the record with the given id.
    ///
    /// # Behavior
    ///
    /// - If no record exists, or `id` is not a valid id, return `StorageResult::Ok(None)`.
    async fn embedding(&mut self, id: &str) -> StorageResult<Option<EmbeddingRecord>>;

    /// Stores an artifact, replacing the previous artifact of the same kind.
    async fn put_artifact(&mut self, kind: ArtifactKind, content: &str) -> StorageResult<()>;

    /// Returns the artifact of the given kind.
    ///
    /// # Behavior
    ///
    /// - If no artifact of that kind has been stored, return `StorageResult::Ok(None)`.
    async fn artifact(&mut self, kind: ArtifactKind)
        -> StorageResult<Option<TrustedSetupArtifact>>;

    /// Checks if the store is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the store is ready to process requests, return `StorageResult::Ok(())`.
    /// If the store cannot process requests because of a connection error, for example,
    /// return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}
