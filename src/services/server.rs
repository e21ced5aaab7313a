//! The server service: custody of encrypted templates and proof verification.
//!
//! The server never sees a plaintext embedding. It stores what the user encrypted, hands it back
//! on request together with the proving artifacts, and checks proofs against the verification
//! key it generated during [`bootstrap`].

use std::{future::Future, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    message::{
        AuthenticationResult,
        EncryptedEmbedding,
        EncryptedPackage,
        ErrorPayload,
        Message,
        MessageType,
        VerificationRequest,
    },
    net::node::{return_address, MessageHandler, Outbox},
    proof::{ProofBackend, ProofError, Verdict},
    storage::{init_with_retry, ArtifactKind, EmbeddingStorage, StorageError},
};

pub const NOT_FOUND: &str = "embedding not found for the given id";
pub const INVALID_PROOF: &str = "invalid zk-SNARK proof";
pub const VERIFICATION_FAILED: &str = "proof verification failed";
pub const MALFORMED_PROOF: &str = "malformed or incomplete proof";
pub const NO_VERIFICATION_KEY: &str = "verification key unavailable";
pub const STORAGE_UNAVAILABLE: &str = "storage unavailable";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("trusted setup failed: {0}")]
    TrustedSetup(#[source] ProofError),
    #[error("failed to persist the {kind}: {source}")]
    Artifact {
        kind: ArtifactKind,
        #[source]
        source: StorageError,
    },
}

/// Brings the server's persistent state up before it accepts any connection.
///
/// Connects to the store (retrying every `retry_delay` until it is ready), runs the trusted setup
/// and persists its three artifacts. The proving key and the circuit are stored base64 encoded,
/// the verification key as text.
///
/// # Errors
/// Fails if the trusted setup fails or an artifact cannot be persisted. Both are fatal.
pub async fn bootstrap<S, P, F, Fut, E>(
    connect: F,
    retry_delay: Duration,
    backend: &P,
) -> Result<S, ServerError>
where
    S: EmbeddingStorage,
    P: ProofBackend,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    E: std::fmt::Display,
{
    let mut store = init_with_retry(connect, retry_delay).await;

    info!("running trusted setup");
    let setup = backend
        .run_trusted_setup()
        .await
        .map_err(ServerError::TrustedSetup)?;

    let artifacts = [
        (ArtifactKind::ProvingKey, base64::encode(&setup.proving_key)),
        (ArtifactKind::Circuit, base64::encode(&setup.circuit)),
        (ArtifactKind::VerificationKey, setup.verification_key),
    ];
    for (kind, content) in artifacts.iter() {
        store
            .put_artifact(*kind, content)
            .await
            .map_err(|source| ServerError::Artifact { kind: *kind, source })?;
        debug!("persisted {}", kind);
    }
    info!("trusted setup artifacts persisted");
    Ok(store)
}

pub struct ServerService<S, P> {
    store: S,
    backend: P,
    outbox: Outbox,
}

impl<S, P> ServerService<S, P>
where
    S: EmbeddingStorage,
    P: ProofBackend,
{
    pub fn new(store: S, backend: P, outbox: Outbox) -> Self {
        Self {
            store,
            backend,
            outbox,
        }
    }

    async fn store_embedding(&self, message: &Message, return_to: &str) {
        let package: EncryptedPackage = match message.payload_of(MessageType::StoreEmbedding) {
            Ok(package) => package,
            Err(err) => return self.registration_error(return_to, err).await,
        };

        let mut store = self.store.clone();
        match store.put_embedding(&package).await {
            Ok(id) => {
                info!("registered template {}", id);
                self.outbox
                    .reply(return_to, MessageType::RegistrationId, &id.to_string())
                    .await
            }
            Err(err) => self.registration_error(return_to, err).await,
        }
    }

    async fn registration_error(&self, return_to: &str, err: impl std::fmt::Display) {
        warn!("registration failed: {}", err);
        self.outbox
            .reply(
                return_to,
                MessageType::RegistrationError,
                &ErrorPayload::new(err),
            )
            .await
    }

    async fn get_embedding(&self, message: &Message, return_to: &str) {
        let id: String = match message.payload_of(MessageType::GetEmbedding) {
            Ok(id) => id,
            Err(err) => {
                warn!("{}", err);
                return self
                    .reject(return_to, AuthenticationResult::rejected(NOT_FOUND))
                    .await;
            }
        };

        match self.lookup(&id).await {
            Ok(Some(embedding)) => {
                debug!("serving template {}", id);
                self.outbox
                    .reply(return_to, MessageType::EncryptedEmbedding, &embedding)
                    .await
            }
            Ok(None) => {
                info!("no template {}", id);
                self.reject(return_to, AuthenticationResult::rejected(NOT_FOUND))
                    .await
            }
            Err(err) => {
                warn!("failed to load template {}: {}", id, err);
                let result = AuthenticationResult::rejected(STORAGE_UNAVAILABLE)
                    .with_details(err.to_string());
                self.reject(return_to, result).await
            }
        }
    }

    /// Loads a template and attaches the proving artifacts, if any are stored.
    async fn lookup(&self, id: &str) -> Result<Option<EncryptedEmbedding>, StorageError> {
        let mut store = self.store.clone();
        let record = match store.embedding(id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let proving_key = store.artifact(ArtifactKind::ProvingKey).await?;
        let circuit = store.artifact(ArtifactKind::Circuit).await?;
        Ok(Some(EncryptedEmbedding {
            package: record.package(),
            proving_key: proving_key.map(|artifact| artifact.content),
            circuit: circuit.map(|artifact| artifact.content),
        }))
    }

    async fn verify_snark_proof(&self, message: &Message, return_to: &str) {
        let result = self.verify(message).await;
        if result.authenticated {
            info!("proof accepted");
        } else {
            info!("proof rejected: {}", result.reason.as_deref().unwrap_or_default());
        }
        self.outbox
            .reply(return_to, MessageType::AuthenticationResult, &result)
            .await
    }

    async fn verify(&self, message: &Message) -> AuthenticationResult {
        let request: VerificationRequest = match message.payload_of(MessageType::VerifySnarkProof) {
            Ok(request) => request,
            Err(err) => {
                return AuthenticationResult::rejected(MALFORMED_PROOF).with_details(err.to_string())
            }
        };
        if let Some(id) = &request.registration_id {
            debug!("verifying proof for template {}", id);
        }

        let mut store = self.store.clone();
        let verification_key = match store.artifact(ArtifactKind::VerificationKey).await {
            Ok(Some(artifact)) => artifact.content,
            Ok(None) => return AuthenticationResult::rejected(NO_VERIFICATION_KEY),
            Err(err) => {
                return AuthenticationResult::rejected(STORAGE_UNAVAILABLE)
                    .with_details(err.to_string())
            }
        };

        match self
            .backend
            .verify_proof(&request.bundle, &verification_key)
            .await
        {
            Ok(Verdict::Valid) => AuthenticationResult::accepted(Utc::now().timestamp()),
            Ok(Verdict::Invalid { details }) => {
                AuthenticationResult::rejected(INVALID_PROOF).with_details(details)
            }
            Err(ProofError::IncompleteBundle) => AuthenticationResult::rejected(MALFORMED_PROOF),
            Err(ProofError::ToolFailed { diagnostics, .. }) => {
                AuthenticationResult::rejected(VERIFICATION_FAILED).with_details(diagnostics)
            }
            Err(err) => {
                AuthenticationResult::rejected(VERIFICATION_FAILED).with_details(err.to_string())
            }
        }
    }

    async fn reject(&self, return_to: &str, result: AuthenticationResult) {
        self.outbox
            .reply(return_to, MessageType::AuthenticationResult, &result)
            .await
    }
}

#[async_trait]
impl<S, P> MessageHandler for ServerService<S, P>
where
    S: EmbeddingStorage,
    P: ProofBackend,
{
    async fn handle(&self, message: Message, peer: SocketAddr) {
        let kind = match message.message_type() {
            Ok(kind) => kind,
            Err(err) => return warn!("dropping message from {}: {}", peer, err),
        };
        if !matches!(
            kind,
            MessageType::StoreEmbedding | MessageType::GetEmbedding | MessageType::VerifySnarkProof
        ) {
            return warn!("dropping unexpected `{}` from {}", kind, peer);
        }
        let return_to = match return_address(&message) {
            Some(address) => address,
            None => return,
        };

        match kind {
            MessageType::StoreEmbedding => self.store_embedding(&message, return_to).await,
            MessageType::GetEmbedding => self.get_embedding(&message, return_to).await,
            _ => self.verify_snark_proof(&message, return_to).await,
        }
    }
}
