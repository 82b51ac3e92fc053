//! Remote object store client: a minimal ranged-GET reader against the
//! bucket holding build artifacts. A thin async wrapper around an HTTP
//! client issuing ranged GETs; `reqwest` handles connection pooling and
//! TLS so there's no need to hand-roll a connector.

use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use log::{debug, warn};

use crate::error::{BlockDeviceError, Result};
use crate::read_at::ReadAt;

/// Ranged-GET client against a remote blob store bucket.
///
/// `key` is the full object key, e.g. `"{build_id}/{suffix}"`; the base
/// URL plus bucket name are supplied once at construction.
pub struct HttpObjectSource {
    client: reqwest::Client,
    url: String,
    size: RwLock<Option<u64>>,
}

impl HttpObjectSource {
    pub fn new(base_url: &str, bucket: &str, key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/{}/{}", base_url.trim_end_matches('/'), bucket, key),
            size: RwLock::new(None),
        }
    }

    async fn fetch_size(&self) -> Result<u64> {
        if let Some(size) = *self.size.read().unwrap() {
            return Ok(size);
        }
        let resp = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(http_err)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(not_found_err(&self.url));
        }
        let len = resp
            .content_length()
            .ok_or_else(|| BlockDeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "object source did not report Content-Length",
            )))?;
        *self.size.write().unwrap() = Some(len);
        Ok(len)
    }
}

fn http_err(err: reqwest::Error) -> BlockDeviceError {
    BlockDeviceError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}

/// A definitive "object missing" is a terminal `Io` error (spec §4.1), not a
/// distinct variant — `ErrorKind::NotFound` is what `Retrier` checks to skip
/// retrying it.
fn not_found_err(url: &str) -> BlockDeviceError {
    BlockDeviceError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("object not found: {}", url),
    ))
}

impl ReadAt for HttpObjectSource {
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let last = off + buf.len().saturating_sub(1) as u64;
            debug!("range GET {} bytes={}-{}", self.url, off, last);

            let resp = self
                .client
                .get(&self.url)
                .header(reqwest::header::RANGE, format!("bytes={}-{}", off, last))
                .send()
                .await
                .map_err(http_err)?;

            match resp.status() {
                reqwest::StatusCode::NOT_FOUND => {
                    return Err(not_found_err(&self.url));
                }
                status if !status.is_success() => {
                    warn!("object source {} returned {}", self.url, status);
                    return Err(BlockDeviceError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("unexpected status {}", status),
                    )));
                }
                _ => {}
            }

            let bytes: bytes::Bytes = resp.bytes().await.map_err(http_err)?;
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        })
    }

    fn size(&self) -> u64 {
        // Best-effort synchronous accessor for an already-resolved size;
        // callers that need the authoritative size before any read should
        // use `fetch_size`. Composition code in this crate always knows the
        // logical size from the build header, so this path is only hit by
        // direct users of a bare `HttpObjectSource`.
        self.size.read().unwrap().unwrap_or(0)
    }
}

impl HttpObjectSource {
    /// Resolve and cache the object's size via an HTTP HEAD request.
    pub async fn resolve_size(&self) -> Result<u64> {
        self.fetch_size().await
    }
}

/// In-memory object source, used in tests and wherever a base reader is
/// already materialized locally rather than backed by a network store.
pub struct MemObjectSource {
    data: Vec<u8>,
}

impl MemObjectSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl ReadAt for MemObjectSource {
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let off = off as usize;
            if off >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - off);
            buf[..n].copy_from_slice(&self.data[off..off + n]);
            Ok(n)
        })
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
