//! Sparse local file, memory-mapped, with a `Marker` tracking which blocks
//! have been populated. Opens the file explicitly, truncates it to the
//! logical device size, and mmaps it read-write rather than going through
//! a higher-level file abstraction.

use std::fs::OpenOptions;
use std::future::Future;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::pin::Pin;

use log::{debug, trace};
use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::{BlockDeviceError, Result};
use crate::marker::Marker;
use crate::range::block_range;
use crate::read_at::{ReadAt, WriteAt};
use crate::sparse_marker::rebuild_marker_from_holes;

/// Narrow interface for cache-layer flush/close, kept separate from
/// `ReadAt`/`WriteAt` so `Overlay` can forward to it without widening those
/// traits for every implementor.
pub trait CacheSync {
    fn sync(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

pub struct MmapCache {
    mmap: RwLock<MmapMut>,
    marker: Marker,
    size: u64,
    block_size: u64,
}

impl MmapCache {
    /// Open or create the cache file at `path`. When `create_file` is
    /// false, the file is assumed to pre-exist and its marker is rebuilt
    /// from the filesystem's hole map.
    pub fn new(size: u64, path: &Path, block_size: u64, create_file: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_file)
            .open(path)?;

        if create_file {
            file.set_len(size)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let num_blocks = (size + block_size - 1) / block_size;
        let marker = Marker::new(num_blocks);

        if !create_file {
            rebuild_marker_from_holes(file.as_raw_fd(), size, block_size, &marker)?;
        }

        Ok(Self {
            mmap: RwLock::new(mmap),
            marker,
            size,
            block_size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Flush dirty mmap pages to the backing file without unmapping.
    /// Callers that just want data durable (e.g. `Overlay::sync`) should use
    /// this instead of `close`.
    pub fn sync(&self) -> Result<()> {
        self.mmap.read().flush()?;
        Ok(())
    }

    /// Flush the mmap and drop it. Unmapping and closing the underlying
    /// file both happen implicitly on drop of `MmapMut`/`File`; any error
    /// during the flush is still reported here so callers can join it with
    /// other close-time errors rather than losing it silently.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

impl CacheSync for MmapCache {
    fn sync(&self) -> Result<()> {
        MmapCache::sync(self)
    }

    fn close(&self) -> Result<()> {
        MmapCache::close(self)
    }
}

impl ReadAt for MmapCache {
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            if off >= self.size {
                return Ok(0);
            }
            let len = (buf.len() as u64).min(self.size - off);
            let (start, end) = block_range(off, len, self.block_size);
            if !self.marker.all_marked(start, end) {
                trace!("cache miss blocks {}..{} (off {})", start, end, off);
                return Err(BlockDeviceError::BytesNotAvailable);
            }
            trace!("cache hit blocks {}..{} (off {})", start, end, off);
            let mmap = self.mmap.read();
            let len = len as usize;
            buf[..len].copy_from_slice(&mmap[off as usize..off as usize + len]);
            Ok(len)
        })
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl WriteAt for MmapCache {
    fn write_at<'a>(
        &'a self,
        buf: &'a [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            if off + buf.len() as u64 > self.size {
                return Err(BlockDeviceError::Eof);
            }
            {
                let mut mmap = self.mmap.write();
                mmap[off as usize..off as usize + buf.len()].copy_from_slice(buf);
            }
            // Marking happens after the bytes are committed to the mmap so
            // that any reader observing a marked block also observes the
            // bytes just written.
            let (start, end) = block_range(off, buf.len() as u64, self.block_size);
            debug!("cache write blocks {}..{} (off {}, len {})", start, end, off, buf.len());
            self.marker.mark_range(start, end);
            Ok(buf.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmarked_read_returns_bytes_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        let cache = MmapCache::new(16384, &path, 4096, true).unwrap();

        let mut buf = vec![0u8; 100];
        let err = cache.read_at(&mut buf, 0).await.unwrap_err();
        assert!(err.is_bytes_not_available());
    }

    #[tokio::test]
    async fn write_then_read_returns_committed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        let cache = MmapCache::new(16384, &path, 4096, true).unwrap();

        let data = vec![0x42u8; 4096];
        cache.write_at(&data, 0).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = cache.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(n, 4096);
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn partially_marked_range_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        let cache = MmapCache::new(16384, &path, 4096, true).unwrap();

        cache.write_at(&vec![1u8; 4096], 0).await.unwrap();
        // Block 1 is still unmarked, so a read spanning blocks 0 and 1 must
        // fail even though block 0 is populated.
        let mut buf = vec![0u8; 4096];
        let err = cache.read_at(&mut buf, 2048).await.unwrap_err();
        assert!(err.is_bytes_not_available());
    }

    #[tokio::test]
    async fn reopen_over_existing_sparse_file_restores_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");

        {
            let cache = MmapCache::new(16384, &path, 4096, true).unwrap();
            cache.write_at(&vec![7u8; 4096], 0).await.unwrap();
            cache.write_at(&vec![7u8; 4096], 16384 - 4096).await.unwrap();
            cache.close().unwrap();
        }

        let reopened = MmapCache::new(16384, &path, 4096, false).unwrap();
        assert!(reopened.marker().is_marked(0));
        assert!(!reopened.marker().is_marked(1));
        assert!(reopened.marker().is_marked(3));
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_random_bytes() {
        use rand::RngCore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache");
        let cache = MmapCache::new(4096 * 4, &path, 4096, true).unwrap();

        let mut data = vec![0u8; 4096 * 4];
        rand::thread_rng().fill_bytes(&mut data);
        cache.write_at(&data, 0).await.unwrap();

        let mut buf = vec![0u8; data.len()];
        let n = cache.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(n, data.len());
        assert_eq!(buf, data);
    }
}
