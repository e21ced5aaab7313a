//! Persistent custody of encrypted templates and trusted setup artifacts.

pub mod memory;
pub mod redis;
pub mod traits;

use std::{fmt::Display, future::Future, time::Duration};

use tracing::{info, warn};

pub use self::traits::{
    ArtifactKind,
    EmbeddingRecord,
    EmbeddingStorage,
    StorageError,
    StorageResult,
    TrustedSetupArtifact,
};

/// Connects to a store, retrying after `delay` until it is reachable and ready.
///
/// This never gives up: a server without its store has nothing to serve.
pub async fn init_with_retry<S, F, Fut, E>(mut connect: F, delay: Duration) -> S
where
    S: EmbeddingStorage,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    E: Display,
{
    let mut attempt = 1_u64;
    loop {
        match connect().await {
            Ok(mut store) => match store.is_ready().await {
                Ok(()) => {
                    info!("store ready after {} attempt(s)", attempt);
                    return store;
                }
                Err(err) => warn!("store is not ready: {}", err),
            },
            Err(err) => warn!("failed to connect to the store: {}", err),
        }
        warn!("retrying in {:?}", delay);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
