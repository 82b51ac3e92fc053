//! The shared async `ReadAt`/`WriteAt` surface every layer of the stack
//! implements: a boxed-future trait object rather than an `async fn` in
//! the trait, so these traits stay object-safe and usable behind `Arc<dyn
//! ReadAt>`.

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// A source of bytes addressable by absolute offset.
///
/// Implementors are not required to fill `buf` completely; returning fewer
/// bytes than requested is only valid at EOF (or, for the cache layer,
/// never; it returns `BytesNotAvailable` instead of a short read).
pub trait ReadAt: Send + Sync {
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;

    fn size(&self) -> u64;
}

/// A sink for bytes addressable by absolute offset.
pub trait WriteAt: Send + Sync {
    fn write_at<'a>(
        &'a self,
        buf: &'a [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;
}

impl ReadAt for std::sync::Arc<dyn ReadAt> {
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        (**self).read_at(buf, off)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// Fully fill `buf` from `reader`, looping over short reads until either
/// `buf` is full or EOF is reached.
pub async fn read_at_exact(reader: &dyn ReadAt, buf: &mut [u8], off: u64) -> Result<()> {
    let mut n = 0usize;
    while n < buf.len() {
        let read = reader.read_at(&mut buf[n..], off + n as u64).await?;
        if read == 0 {
            return Err(crate::error::BlockDeviceError::Eof);
        }
        n += read;
    }
    Ok(())
}
