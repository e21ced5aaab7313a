//! Protocol messages exchanged between the model, server and user services.
//!
//! Every request and response is a single [`Message`]: a `type` tag, an arbitrary JSON `data`
//! payload and the `return_to` address the receiver pushes its reply to. The typed payloads
//! below describe what `data` holds for each [`MessageType`].

use std::{fmt, str::FromStr};

use derive_more::Display;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The closed set of message tags understood by the services.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum MessageType {
    #[display(fmt = "generate_embedding")]
    GenerateEmbedding,
    #[display(fmt = "embedding")]
    Embedding,
    #[display(fmt = "embedding_error")]
    EmbeddingError,
    #[display(fmt = "generate_snark_proof")]
    GenerateSnarkProof,
    #[display(fmt = "snark_proof")]
    SnarkProof,
    #[display(fmt = "snark_proof_error")]
    SnarkProofError,
    #[display(fmt = "store_embedding")]
    StoreEmbedding,
    #[display(fmt = "registration_id")]
    RegistrationId,
    #[display(fmt = "registration_error")]
    RegistrationError,
    #[display(fmt = "get_embedding")]
    GetEmbedding,
    #[display(fmt = "encrypted_embedding")]
    EncryptedEmbedding,
    #[display(fmt = "verify_snark_proof")]
    VerifySnarkProof,
    #[display(fmt = "authentication_result")]
    AuthenticationResult,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::GenerateEmbedding,
        MessageType::Embedding,
        MessageType::EmbeddingError,
        MessageType::GenerateSnarkProof,
        MessageType::SnarkProof,
        MessageType::SnarkProofError,
        MessageType::StoreEmbedding,
        MessageType::RegistrationId,
        MessageType::RegistrationError,
        MessageType::GetEmbedding,
        MessageType::EncryptedEmbedding,
        MessageType::VerifySnarkProof,
        MessageType::AuthenticationResult,
    ];
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown message type: {0}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|kind| kind.to_string() == s)
            .copied()
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

/// An error raised when a message does not carry what its type promises.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("expected a `{expected}` message, got `{actual}`")]
    UnexpectedType { expected: MessageType, actual: String },
    #[error("malformed `{kind}` payload: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The envelope of every message on the wire.
///
/// The tag is kept as a plain string so that messages with an unknown `type` still decode and
/// can be logged and dropped by the receiver.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,
}

impl Message {
    /// Creates a message of the given type carrying `data`.
    pub fn new<T: Serialize>(kind: MessageType, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_string(),
            data: serde_json::to_value(data)?,
            return_to: None,
        })
    }

    /// Sets the address the receiver must reply to.
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.return_to = Some(address.into());
        self
    }

    /// Parses the type tag.
    pub fn message_type(&self) -> Result<MessageType, UnknownMessageType> {
        self.kind.parse()
    }

    /// Decodes the payload as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_value(self.data.clone()).map_err(|source| PayloadError::Malformed {
            kind: self.kind.clone(),
            source,
        })
    }

    /// Decodes the payload as `T` after checking that the message has the `expected` type.
    pub fn payload_of<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, PayloadError> {
        if self.kind != expected.to_string() {
            return Err(PayloadError::UnexpectedType {
                expected,
                actual: self.kind.clone(),
            });
        }
        self.payload()
    }
}

/// A biometric feature vector as produced by the feature extractor.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Embedding(pub Vec<f64>);

impl Embedding {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cosine similarity between two embeddings. Returns `None` if the lengths differ or one
    /// of the vectors has no magnitude.
    pub fn cosine_similarity(&self, other: &Embedding) -> Option<f64> {
        if self.len() != other.len() {
            return None;
        }
        let dot: f64 = self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum();
        let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
        let magnitude = norm(&self.0) * norm(&other.0);
        if magnitude == 0. {
            None
        } else {
            Some(dot / magnitude)
        }
    }
}

/// Ciphertext of an embedding together with the IV it was encrypted under, both base64.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EncryptedPackage {
    pub data: String,
    pub iv: String,
}

/// Payload of `encrypted_embedding`: the stored template plus the proving artifacts the model
/// needs, so that it does not have to hold its own copy.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EncryptedEmbedding {
    #[serde(flatten)]
    pub package: EncryptedPackage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proving_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<String>,
}

/// Payload of `generate_snark_proof`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SnarkProofRequest {
    /// The base64 encoded authentication photo.
    pub new_photo: String,
    /// The decrypted registration embedding.
    pub old_embedding: Embedding,
    /// Base64 encoded proving key, if distributed by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proving_key: Option<String>,
    /// Base64 encoded circuit, if distributed by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<String>,
}

/// A zero-knowledge proof and its public parameters as emitted by the prover.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProofBundle {
    pub proof: Value,
    pub public_params: Value,
}

/// Payload of `verify_snark_proof`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VerificationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<String>,
    #[serde(flatten)]
    pub bundle: ProofBundle,
}

/// Payload of every `*_error` message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn new(error: impl fmt::Display) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

/// The terminal value of the authentication saga.
///
/// Use [`AuthenticationResult::accepted`] and [`AuthenticationResult::rejected`] so that an
/// accepted result always has a timestamp and never a reason.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AuthenticationResult {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Seconds since the unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl AuthenticationResult {
    pub fn accepted(timestamp: i64) -> Self {
        Self {
            authenticated: true,
            reason: None,
            details: None,
            timestamp: Some(timestamp),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            reason: Some(reason.into()),
            details: None,
            timestamp: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
