//! Zero-knowledge proofs of embedding similarity.
//!
//! The circuit and its toolchain are external. A [`ProofBackend`] runs the trusted setup once
//! on the server, generates proofs on the model and verifies them on the server again.

pub mod fixed_point;
pub mod snark;

use std::{io, path::PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

pub use self::snark::SnarkBackend;
use crate::{
    message::{Embedding, ProofBundle},
    process::ProcessError,
};

#[derive(Debug, Error)]
pub enum ProofError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("{tool} exited with {code:?}: {diagnostics}")]
    ToolFailed {
        tool: &'static str,
        code: Option<i32>,
        diagnostics: String,
    },
    #[error("missing output {}: {source}", path.display())]
    MissingOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid json in {}: {source}", path.display())]
    InvalidOutput {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write toolchain input: {0}")]
    Io(#[from] io::Error),
    #[error("embeddings differ in dimension: {old} vs {new}")]
    DimensionMismatch { old: usize, new: usize },
    #[error("proof bundle is incomplete")]
    IncompleteBundle,
    #[error("no {tool} command configured")]
    NotConfigured { tool: &'static str },
}

/// The artifacts produced by the trusted setup.
#[derive(Clone, Debug, PartialEq)]
pub struct TrustedSetup {
    pub proving_key: Vec<u8>,
    pub circuit: Vec<u8>,
    /// The verification key is a JSON document and kept as text.
    pub verification_key: String,
}

/// What a prover needs besides the witness.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvingArtifacts {
    pub proving_key: Vec<u8>,
    pub circuit: Vec<u8>,
}

/// The outcome of a verification that ran to completion.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Valid,
    /// The verifier finished but did not accept the proof.
    Invalid { details: String },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
/// An adapter to a zero-knowledge toolchain.
pub trait ProofBackend: Send + Sync + 'static {
    /// Generates the proving key, circuit and verification key.
    async fn run_trusted_setup(&self) -> Result<TrustedSetup, ProofError>;

    /// Proves that the similarity of `old` and `new` reaches `threshold` without revealing them.
    ///
    /// When `artifacts` is `None` the backend uses whatever artifacts it already holds.
    async fn generate_proof(
        &self,
        old: &Embedding,
        new: &Embedding,
        threshold: f64,
        artifacts: Option<ProvingArtifacts>,
    ) -> Result<ProofBundle, ProofError>;

    /// Checks `bundle` against the verification key.
    ///
    /// # Errors
    /// Fails if the verifier could not run or crashed. A verifier that runs and rejects the proof
    /// yields [`Verdict::Invalid`].
    async fn verify_proof(
        &self,
        bundle: &ProofBundle,
        verification_key: &str,
    ) -> Result<Verdict, ProofError>;
}
