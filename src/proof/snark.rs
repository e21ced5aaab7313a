//! A [`ProofBackend`] driving an external zk-SNARK toolchain.
//!
//! The toolchain communicates through well-known files in its work directory:
//!
//! ```text
//! setup                                  -> proving_key, circuit, verification_key
//! prove <witness>                        -> proof, public_parameters
//! verify <proof> <public_parameters> <verification_key>
//! ```
//!
//! Since the file names are fixed, toolchain invocations of one backend never overlap.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    message::{Embedding, ProofBundle},
    process::{self, ProcessOutput},
    proof::{
        fixed_point::{embedding_to_fixed, to_fixed},
        ProofBackend,
        ProofError,
        ProvingArtifacts,
        TrustedSetup,
        Verdict,
    },
    settings::SnarkSettings,
};

/// The private input of the similarity circuit.
#[derive(Debug, Serialize)]
struct Witness {
    embedding1: Vec<i64>,
    embedding2: Vec<i64>,
    threshold: i64,
}

pub struct SnarkBackend {
    settings: SnarkSettings,
    lock: Mutex<()>,
}

impl SnarkBackend {
    pub fn new(settings: SnarkSettings) -> Self {
        Self {
            settings,
            lock: Mutex::new(()),
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.settings.workdir.join(file)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    async fn run(
        &self,
        tool: &'static str,
        command: &Option<process::CommandSpec>,
        args: Vec<PathBuf>,
    ) -> Result<ProcessOutput, ProofError> {
        let command = command
            .as_ref()
            .ok_or(ProofError::NotConfigured { tool })?;
        let workdir = Some(self.settings.workdir.as_path());
        let output = process::run(command, args, workdir, self.timeout()).await?;
        debug!("{} exited with {:?}", tool, output.code);
        Ok(output)
    }

    async fn read_json(&self, path: &Path) -> Result<Value, ProofError> {
        let raw = fs::read(path)
            .await
            .map_err(|source| ProofError::MissingOutput {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_slice(&raw).map_err(|source| ProofError::InvalidOutput {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), ProofError> {
        let raw = serde_json::to_vec_pretty(value).map_err(|source| ProofError::InvalidOutput {
            path: path.to_path_buf(),
            source,
        })?;
        self.write(path, raw).await
    }

    /// Writes a toolchain input, creating its directory if needed.
    async fn write(&self, path: &Path, contents: impl AsRef<[u8]>) -> Result<(), ProofError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, contents).await?;
        Ok(())
    }

    async fn read_output(&self, path: PathBuf) -> Result<Vec<u8>, ProofError> {
        fs::read(&path)
            .await
            .map_err(|source| ProofError::MissingOutput { path, source })
    }

    async fn remove_stale(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove stale {}: {}", path.display(), err);
            }
        }
    }
}

#[async_trait]
impl ProofBackend for SnarkBackend {
    async fn run_trusted_setup(&self) -> Result<TrustedSetup, ProofError> {
        let _guard = self.lock.lock().await;
        info!("running trusted setup");

        let output = self
            .run("setup", &self.settings.setup_command, Vec::new())
            .await?;
        if !output.success() {
            return Err(ProofError::ToolFailed {
                tool: "setup",
                code: output.code,
                diagnostics: output.diagnostics().to_string(),
            });
        }

        let files = &self.settings.files;
        let proving_key = self.read_output(self.path(&files.proving_key)).await?;
        let circuit = self.read_output(self.path(&files.circuit)).await?;
        let verification_key = self.read_output(self.path(&files.verification_key)).await?;
        Ok(TrustedSetup {
            proving_key,
            circuit,
            verification_key: String::from_utf8_lossy(&verification_key).into_owned(),
        })
    }

    async fn generate_proof(
        &self,
        old: &Embedding,
        new: &Embedding,
        threshold: f64,
        artifacts: Option<ProvingArtifacts>,
    ) -> Result<ProofBundle, ProofError> {
        if old.len() != new.len() {
            return Err(ProofError::DimensionMismatch {
                old: old.len(),
                new: new.len(),
            });
        }

        let _guard = self.lock.lock().await;
        let files = &self.settings.files;

        if let Some(artifacts) = artifacts {
            self.write(&self.path(&files.proving_key), &artifacts.proving_key)
                .await?;
            self.write(&self.path(&files.circuit), &artifacts.circuit)
                .await?;
            debug!(
                "installed proving key ({} bytes) and circuit ({} bytes)",
                artifacts.proving_key.len(),
                artifacts.circuit.len()
            );
        }

        let scale = self.settings.scale;
        let witness = Witness {
            embedding1: embedding_to_fixed(old, scale),
            embedding2: embedding_to_fixed(new, scale),
            threshold: to_fixed(threshold, scale),
        };
        let witness_path = self.path(&files.witness);
        self.write_json(&witness_path, &witness).await?;

        let proof_path = self.path(&files.proof);
        let public_path = self.path(&files.public_parameters);
        self.remove_stale(&proof_path).await;
        self.remove_stale(&public_path).await;

        let output = self
            .run("prove", &self.settings.prove_command, vec![witness_path])
            .await?;
        if !output.success() {
            return Err(ProofError::ToolFailed {
                tool: "prove",
                code: output.code,
                diagnostics: output.diagnostics().to_string(),
            });
        }

        Ok(ProofBundle {
            proof: self.read_json(&proof_path).await?,
            public_params: self.read_json(&public_path).await?,
        })
    }

    async fn verify_proof(
        &self,
        bundle: &ProofBundle,
        verification_key: &str,
    ) -> Result<Verdict, ProofError> {
        if bundle.proof.is_null() || bundle.public_params.is_null() || verification_key.is_empty()
        {
            return Err(ProofError::IncompleteBundle);
        }

        let _guard = self.lock.lock().await;
        let files = &self.settings.files;
        let proof_path = self.path(&files.proof);
        let public_path = self.path(&files.public_parameters);
        let key_path = self.path(&files.verification_key);

        self.write_json(&proof_path, &bundle.proof).await?;
        self.write_json(&public_path, &bundle.public_params).await?;
        self.write(&key_path, verification_key).await?;

        let output = self
            .run(
                "verify",
                &self.settings.verify_command,
                vec![proof_path, public_path, key_path],
            )
            .await?;
        if !output.success() {
            return Err(ProofError::ToolFailed {
                tool: "verify",
                code: output.code,
                diagnostics: output.diagnostics().to_string(),
            });
        }

        if output.stdout.contains(&self.settings.success_marker) {
            Ok(Verdict::Valid)
        } else {
            Ok(Verdict::Invalid {
                details: output.diagnostics().to_string(),
            })
        }
    }
}
