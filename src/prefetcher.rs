//! Background warm-up task: walks every chunk index
//! of a device and issues a zero-length read to the base reader, relying
//! on the Chunker's zero-length-is-a-prefetch-hint convention to populate
//! the cache without blocking any caller.

use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::range::chunk_count;
use crate::read_at::ReadAt;

pub struct Prefetcher {
    base: Arc<dyn ReadAt>,
    size: u64,
    chunk_size: u64,
    cancel: CancellationToken,
}

impl Prefetcher {
    pub fn new(base: Arc<dyn ReadAt>, size: u64, chunk_size: u64, cancel: CancellationToken) -> Self {
        Self {
            base,
            size,
            chunk_size,
            cancel,
        }
    }

    /// Walk every chunk in ascending order, issuing a zero-length prefetch
    /// read to each. Errors are logged, never propagated: one bad chunk
    /// must not stop the rest of the sweep.
    pub async fn run(&self) {
        let total = chunk_count(self.size, self.chunk_size);
        info!("prefetcher: warming {} chunks", total);
        for c in 0..total {
            if self.cancel.is_cancelled() {
                info!("prefetcher: cancelled after {} of {} chunks", c, total);
                return;
            }
            let off = c * self.chunk_size;
            if let Err(err) = self.base.read_at(&mut [], off).await {
                warn!("prefetcher: chunk {} prefetch failed: {}", c, err);
            }
        }
        info!("prefetcher: warmed all {} chunks", total);
    }

    /// Spawn `run` on its own task, returning a handle the caller may
    /// optionally await or drop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}
