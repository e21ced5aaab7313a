//! The model service: embedding extraction and proof generation.
//!
//! The model holds no durable state. Each request runs through its own small state machine:
//!
//! ```text
//! generate_embedding:   Idle -> Extracting -> Emitted | Failed
//! generate_snark_proof: Idle -> ExtractingNew -> Proving -> Emitted | Failed
//! ```

use std::net::SocketAddr;

use async_trait::async_trait;
use derive_more::Display;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    extractor::{ExtractionError, FeatureExtractor},
    message::{
        Embedding,
        ErrorPayload,
        Message,
        MessageType,
        PayloadError,
        ProofBundle,
        SnarkProofRequest,
    },
    net::node::{return_address, MessageHandler, Outbox},
    proof::{ProofBackend, ProofError, ProvingArtifacts},
};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("proof generation failed: {0}")]
    Proof(#[from] ProofError),
    #[error("invalid base64 in `{field}`: {source}")]
    Artifact {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
}

#[derive(Clone, Copy, Debug, Display, PartialEq)]
enum Phase {
    #[display(fmt = "extracting")]
    Extracting,
    #[display(fmt = "extracting new")]
    ExtractingNew,
    #[display(fmt = "proving")]
    Proving,
}

pub struct ModelService<E, P> {
    extractor: E,
    backend: P,
    outbox: Outbox,
    threshold: f64,
    dimensions: usize,
}

impl<E, P> ModelService<E, P>
where
    E: FeatureExtractor,
    P: ProofBackend,
{
    pub fn new(extractor: E, backend: P, outbox: Outbox, threshold: f64, dimensions: usize) -> Self {
        Self {
            extractor,
            backend,
            outbox,
            threshold,
            dimensions,
        }
    }

    /// Decodes a base64 photo and extracts the embedding of the face in it.
    async fn embed(&self, photo: &str, phase: Phase) -> Result<Embedding, ModelError> {
        debug!("phase: {}", phase);
        let image = base64::decode(photo).map_err(ExtractionError::from)?;
        let embedding = self.extractor.extract(&image).await?;
        if embedding.len() != self.dimensions {
            return Err(ExtractionError::Dimension {
                expected: self.dimensions,
                actual: embedding.len(),
            }
            .into());
        }
        Ok(embedding)
    }

    async fn generate_embedding(&self, message: &Message) -> Result<Embedding, ModelError> {
        let photo: String = message.payload_of(MessageType::GenerateEmbedding)?;
        self.embed(&photo, Phase::Extracting).await
    }

    async fn generate_snark_proof(&self, message: &Message) -> Result<ProofBundle, ModelError> {
        let request: SnarkProofRequest = message.payload_of(MessageType::GenerateSnarkProof)?;
        let artifacts = match (&request.proving_key, &request.circuit) {
            (Some(proving_key), Some(circuit)) => Some(ProvingArtifacts {
                proving_key: decode_artifact("proving_key", proving_key)?,
                circuit: decode_artifact("circuit", circuit)?,
            }),
            _ => None,
        };

        let new = self.embed(&request.new_photo, Phase::ExtractingNew).await?;
        debug!("phase: {}", Phase::Proving);
        let bundle = self
            .backend
            .generate_proof(&request.old_embedding, &new, self.threshold, artifacts)
            .await?;
        Ok(bundle)
    }
}

fn decode_artifact(field: &'static str, content: &str) -> Result<Vec<u8>, ModelError> {
    base64::decode(content).map_err(|source| ModelError::Artifact { field, source })
}

#[async_trait]
impl<E, P> MessageHandler for ModelService<E, P>
where
    E: FeatureExtractor,
    P: ProofBackend,
{
    async fn handle(&self, message: Message, peer: SocketAddr) {
        let kind = match message.message_type() {
            Ok(kind @ MessageType::GenerateEmbedding) | Ok(kind @ MessageType::GenerateSnarkProof) => {
                kind
            }
            Ok(kind) => return warn!("dropping unexpected `{}` from {}", kind, peer),
            Err(err) => return warn!("dropping message from {}: {}", peer, err),
        };
        let return_to = match return_address(&message) {
            Some(address) => address,
            None => return,
        };

        match kind {
            MessageType::GenerateEmbedding => match self.generate_embedding(&message).await {
                Ok(embedding) => {
                    info!("emitted embedding of dimension {}", embedding.len());
                    self.outbox
                        .reply(return_to, MessageType::Embedding, &embedding)
                        .await
                }
                Err(err) => {
                    warn!("embedding failed: {}", err);
                    self.outbox
                        .reply(return_to, MessageType::EmbeddingError, &ErrorPayload::new(err))
                        .await
                }
            },
            _ => match self.generate_snark_proof(&message).await {
                Ok(bundle) => {
                    info!("emitted proof");
                    self.outbox
                        .reply(return_to, MessageType::SnarkProof, &bundle)
                        .await
                }
                Err(err) => {
                    warn!("proof failed: {}", err);
                    self.outbox
                        .reply(return_to, MessageType::SnarkProofError, &ErrorPayload::new(err))
                        .await
                }
            },
        }
    }
}
