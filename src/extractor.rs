//! Biometric feature extraction.
//!
//! The neural network lives outside of this crate. [`CommandExtractor`] talks to it through an
//! external process: the image is written to a file in the work directory, its path is appended
//! to the configured command, and the process prints the embedding as a JSON array on stdout, or
//! `null` if no face was detected.

use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    message::Embedding,
    process::{self, CommandSpec, ProcessError},
};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no face detected in image")]
    NotFound,
    #[error("image is not valid base64: {0}")]
    InvalidImage(#[from] base64::DecodeError),
    #[error("expected an embedding of dimension {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("failed to stage image: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("extractor failed: {0}")]
    Failed(String),
    #[error("extractor printed an invalid embedding: {0}")]
    Output(#[source] serde_json::Error),
}

#[cfg_attr(test, automock)]
#[async_trait]
/// Turns an image into an embedding.
pub trait FeatureExtractor: Send + Sync + 'static {
    /// Extracts the embedding of the single face in `image`.
    ///
    /// # Errors
    /// Returns [`ExtractionError::NotFound`] if the image does not contain a face.
    async fn extract(&self, image: &[u8]) -> Result<Embedding, ExtractionError>;
}

/// A [`FeatureExtractor`] backed by an external program.
#[derive(Clone, Debug)]
pub struct CommandExtractor {
    command: CommandSpec,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(command: CommandSpec, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FeatureExtractor for CommandExtractor {
    async fn extract(&self, image: &[u8]) -> Result<Embedding, ExtractionError> {
        let path = self.workdir.join(format!("image-{}", Uuid::new_v4()));
        fs::write(&path, image).await?;
        debug!("staged {} byte image at {}", image.len(), path.display());

        let workdir = Some(self.workdir.as_path());
        let output = process::run(&self.command, vec![&path], workdir, self.timeout).await;
        if let Err(err) = fs::remove_file(&path).await {
            warn!("failed to remove {}: {}", path.display(), err);
        }

        let output = output?;
        if !output.success() {
            return Err(ExtractionError::Failed(output.diagnostics().to_string()));
        }
        serde_json::from_str::<Option<Embedding>>(output.stdout.trim())
            .map_err(ExtractionError::Output)?
            .ok_or(ExtractionError::NotFound)
    }
}
