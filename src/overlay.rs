//! Copy-on-write overlay in front of a cache: reads
//! fall through to a base reader on a cache miss, writes land in the cache
//! only, and an optional `cache_reads` flag warms the cache from fall-
//! through reads.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::warn;

use crate::cache::CacheSync;
use crate::error::{BlockDeviceError, Result};
use crate::read_at::{ReadAt, WriteAt};

pub struct Overlay<C> {
    cache: Arc<C>,
    base: Arc<dyn ReadAt>,
    cache_reads: bool,
    size: u64,
}

impl<C> Overlay<C>
where
    C: ReadAt + WriteAt + Send + Sync,
{
    pub fn new(cache: Arc<C>, base: Arc<dyn ReadAt>, cache_reads: bool, size: u64) -> Self {
        Self {
            cache,
            base,
            cache_reads,
            size,
        }
    }

}

impl<C> Overlay<C>
where
    C: ReadAt + WriteAt + CacheSync + Send + Sync,
{
    /// Flush the cache without closing it.
    pub async fn sync(&self) -> Result<()> {
        self.cache.sync()
    }

    /// Flush and close the underlying cache.
    pub async fn close(&self) -> Result<()> {
        self.cache.close()
    }
}

impl<C> ReadAt for Overlay<C>
where
    C: ReadAt + WriteAt + Send + Sync,
{
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            match self.cache.read_at(buf, off).await {
                Ok(n) => Ok(n),
                Err(BlockDeviceError::BytesNotAvailable) => {
                    let n = self.base.read_at(buf, off).await?;
                    if self.cache_reads && n > 0 {
                        if let Err(err) = self.cache.write_at(&buf[..n], off).await {
                            warn!("overlay: best-effort cache warm at {} failed: {}", off, err);
                        }
                    }
                    Ok(n)
                }
                Err(err) => Err(err),
            }
        })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl<C> WriteAt for Overlay<C>
where
    C: ReadAt + WriteAt + Send + Sync,
{
    fn write_at<'a>(
        &'a self,
        buf: &'a [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        self.cache.write_at(buf, off)
    }
}
