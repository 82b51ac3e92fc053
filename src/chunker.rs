//! The concurrency core: pulls chunks from a base `ReadAt` into the local
//! cache on demand, coordinating concurrent callers so each chunk is
//! fetched at most once.
//!
//! The single-flight map is keyed by chunk index, with each entry holding a
//! `Shared` future the owning task resolves once and every waiter clones
//! and awaits. `Shared` (unlike a bare `tokio::sync::Notify`) makes this
//! race-free regardless of when a waiter joins relative to completion: a
//! clone taken after the fetch has already resolved yields the cached
//! result immediately rather than waiting on a notification that already
//! fired. The map's mutex is held only for the short critical section that
//! decides ownership, not across the fetch itself.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::{join_all, FutureExt, Shared};
use log::{debug, error, trace};
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{BlockDeviceError, Result};
use crate::range::{chunk_len, chunk_range};
use crate::read_at::{ReadAt, WriteAt};

/// A chunk fetch's outcome, broadcast to every waiter exactly once.
type FetchSignal = Shared<Pin<Box<dyn Future<Output = Result<()>> + Send>>>;

fn new_fetch_signal() -> (oneshot::Sender<Result<()>>, FetchSignal) {
    let (tx, rx) = oneshot::channel();
    let fut: Pin<Box<dyn Future<Output = Result<()>> + Send>> = Box::pin(async move {
        match rx.await {
            Ok(result) => result,
            // Sender dropped without sending, e.g. the owning task panicked;
            // waiters must still be unblocked.
            Err(_) => Err(BlockDeviceError::Cancelled),
        }
    });
    (tx, fut.shared())
}

pub struct Chunker<C> {
    base: Arc<dyn ReadAt>,
    cache: Arc<C>,
    chunk_size: u64,
    size: u64,
    in_progress: Mutex<HashMap<u64, FetchSignal>>,
    fetch_sem: Semaphore,
    prefetch_sem: Semaphore,
    cancel: CancellationToken,
}

impl<C> Chunker<C>
where
    C: ReadAt + WriteAt + Send + Sync + 'static,
{
    pub fn new(
        base: Arc<dyn ReadAt>,
        cache: Arc<C>,
        chunk_size: u64,
        size: u64,
        fetch_permits: usize,
        prefetch_permits: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            base,
            cache,
            chunk_size,
            size,
            in_progress: Mutex::new(HashMap::new()),
            fetch_sem: Semaphore::new(fetch_permits),
            prefetch_sem: Semaphore::new(prefetch_permits),
            cancel,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Ensure every chunk in `chunk_ids` is cache-resident, fetching
    /// whichever ones nobody else is already fetching.
    pub async fn ensure_chunks(&self, chunk_ids: &[u64], prefetch: bool) -> Result<()> {
        let mut owned = Vec::new();
        let mut waiting = Vec::new();

        {
            let mut map = self.in_progress.lock().await;
            for &c in chunk_ids {
                if let Some(existing) = map.get(&c) {
                    trace!("chunker: chunk {} joining in-flight fetch", c);
                    waiting.push(existing.clone());
                } else {
                    trace!("chunker: chunk {} owned, scheduling fetch (prefetch={})", c, prefetch);
                    let (tx, signal) = new_fetch_signal();
                    map.insert(c, signal.clone());
                    owned.push((c, tx));
                    waiting.push(signal);
                }
            }
        }
        debug!(
            "chunker: ensure_chunks {} ids, {} owned, {} joined",
            chunk_ids.len(),
            owned.len(),
            chunk_ids.len() - owned.len()
        );

        // Kick off every newly-owned fetch concurrently (bounded by the
        // fetch/prefetch semaphores, not by this loop) rather than awaiting
        // them one at a time; a multi-chunk read must not serialize fetches
        // that could otherwise run in parallel.
        join_all(owned.into_iter().map(|(c, tx)| self.fetch_one(c, prefetch, tx))).await;

        let mut first_err = None;
        for signal in waiting {
            if let Err(err) = signal.await {
                debug!("chunker: chunk completed with error: {}", err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch_one(&self, c: u64, prefetch: bool, tx: oneshot::Sender<Result<()>>) {
        let sem = if prefetch {
            &self.prefetch_sem
        } else {
            &self.fetch_sem
        };

        let permit = tokio::select! {
            res = sem.acquire() => match res {
                Ok(permit) => Some(permit),
                Err(_) => None, // semaphore closed, treat as cancelled
            },
            _ = self.cancel.cancelled() => None,
        };

        let result = match permit {
            None => Err(BlockDeviceError::Cancelled),
            Some(_permit) => {
                if self.cancel.is_cancelled() {
                    Err(BlockDeviceError::Cancelled)
                } else {
                    self.do_fetch(c).await
                }
            }
        };

        self.finish(c, result, tx).await;
    }

    async fn do_fetch(&self, c: u64) -> Result<()> {
        let expected = chunk_len(c, self.size, self.chunk_size);
        if expected == 0 {
            return Ok(());
        }
        let off = c * self.chunk_size;
        let mut buf = vec![0u8; expected as usize];
        let n = self.base.read_at(&mut buf, off).await?;
        if n as u64 != expected {
            error!(
                "chunker: chunk {} short read from base, expected {} got {}",
                c, expected, n
            );
            return Err(BlockDeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short chunk fetch for chunk {}: expected {} bytes, got {}", c, expected, n),
            )));
        }
        self.cache.write_at(&buf[..n], off).await?;
        Ok(())
    }

    async fn finish(&self, c: u64, result: Result<()>, tx: oneshot::Sender<Result<()>>) {
        // Remove the entry before broadcasting so a subsequent
        // `ensure_chunks` call for the same chunk after an error starts a
        // fresh fetch rather than joining this (already-resolved, and
        // therefore forever-errored) signal. Waiters already holding a
        // clone of the signal are unaffected by the removal.
        {
            let mut map = self.in_progress.lock().await;
            map.remove(&c);
        }
        let _ = tx.send(result);
    }

    fn chunk_ids_for(&self, off: u64, len: u64) -> Vec<u64> {
        let (start, end) = chunk_range(off, len, self.chunk_size);
        (start..end).collect()
    }
}

impl<C> ReadAt for Chunker<C>
where
    C: ReadAt + WriteAt + Send + Sync + 'static,
{
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            if buf.is_empty() {
                let ids = self.chunk_ids_for(off, 0);
                self.ensure_chunks(&ids, true).await?;
                return Ok(0);
            }

            match self.cache.read_at(buf, off).await {
                Ok(n) => Ok(n),
                Err(BlockDeviceError::BytesNotAvailable) => {
                    let ids = self.chunk_ids_for(off, buf.len() as u64);
                    self.ensure_chunks(&ids, false).await?;
                    self.cache.read_at(buf, off).await
                }
                Err(err) => Err(err),
            }
        })
    }

    fn size(&self) -> u64 {
        self.size
    }
}
