//! Bounded retry wrapper around a `ReadAt`.
//!
//! Policy is deliberately simple: linear delay, no backoff multiplier,
//! since the remote object store client already backs off internally; this
//! layer only needs to smooth over brief transient failures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::error::{BlockDeviceError, Result};
use crate::read_at::ReadAt;

pub struct Retrier<R> {
    inner: R,
    max_retries: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl<R: ReadAt> Retrier<R> {
    pub fn new(inner: R, max_retries: u32, retry_delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            inner,
            max_retries,
            retry_delay,
            cancel,
        }
    }

    pub fn new_with_defaults(inner: R, cancel: CancellationToken) -> Self {
        Self::new(inner, 3, Duration::from_millis(10), cancel)
    }
}

impl<R: ReadAt> ReadAt for Retrier<R> {
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let mut attempt = 0;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(BlockDeviceError::Cancelled);
                }

                match self.inner.read_at(buf, off).await {
                    Ok(n) => return Ok(n),
                    Err(BlockDeviceError::Eof) => return Err(BlockDeviceError::Eof),
                    Err(BlockDeviceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        // definitive terminal error, never retried
                        return Err(BlockDeviceError::Io(e));
                    }
                    Err(err) if attempt < self.max_retries => {
                        attempt += 1;
                        warn!(
                            "retrier: attempt {} failed at offset {}: {} (retrying in {:?})",
                            attempt, off, err, self.retry_delay
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(self.retry_delay) => {}
                            _ = self.cancel.cancelled() => {
                                return Err(BlockDeviceError::Cancelled);
                            }
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
        })
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }
}

/// Convenience constructor for the common case of wrapping an `Arc<dyn
/// ReadAt>` base reader.
pub fn wrap_dyn(
    inner: Arc<dyn ReadAt>,
    max_retries: u32,
    retry_delay: Duration,
    cancel: CancellationToken,
) -> Retrier<Arc<dyn ReadAt>> {
    Retrier::new(inner, max_retries, retry_delay, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyReader {
        fail_times: AtomicUsize,
        data: Vec<u8>,
    }

    impl ReadAt for FlakyReader {
        fn read_at<'a>(
            &'a self,
            buf: &'a mut [u8],
            off: u64,
        ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
            Box::pin(async move {
                if self.fail_times.load(Ordering::SeqCst) > 0 {
                    self.fail_times.fetch_sub(1, Ordering::SeqCst);
                    return Err(BlockDeviceError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "transient",
                    )));
                }
                let off = off as usize;
                let n = buf.len().min(self.data.len() - off);
                buf[..n].copy_from_slice(&self.data[off..off + n]);
                Ok(n)
            })
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let reader = FlakyReader {
            fail_times: AtomicUsize::new(2),
            data: vec![9u8; 16],
        };
        let retrier = Retrier::new(
            reader,
            3,
            Duration::from_millis(1),
            CancellationToken::new(),
        );
        let mut buf = vec![0u8; 16];
        let n = retrier.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf, vec![9u8; 16]);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let reader = FlakyReader {
            fail_times: AtomicUsize::new(10),
            data: vec![9u8; 16],
        };
        let retrier = Retrier::new(
            reader,
            2,
            Duration::from_millis(1),
            CancellationToken::new(),
        );
        let mut buf = vec![0u8; 16];
        let err = retrier.read_at(&mut buf, 0).await.unwrap_err();
        assert!(matches!(err, BlockDeviceError::Io(_)));
    }

    #[tokio::test]
    async fn cancellation_aborts_immediately() {
        let reader = FlakyReader {
            fail_times: AtomicUsize::new(10),
            data: vec![9u8; 16],
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let retrier = Retrier::new(reader, 5, Duration::from_secs(30), cancel);
        let mut buf = vec![0u8; 16];
        let err = retrier.read_at(&mut buf, 0).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
