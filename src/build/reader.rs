//! Composes a `BuildHeader` with a `Store` of per-build readers into a
//! single logical `ReadAt` over a VM disk image, so a build can reference
//! bytes from any ancestor build without copying them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::build::header::BuildHeader;
use crate::error::Result;
use crate::read_at::ReadAt;
use crate::store::Store;

pub struct Build {
    header: BuildHeader,
    store: Arc<Store>,
    suffix: String,
}

impl Build {
    pub fn new(header: BuildHeader, store: Arc<Store>, suffix: impl Into<String>) -> Self {
        Self {
            header,
            store,
            suffix: suffix.into(),
        }
    }

    pub fn header(&self) -> &BuildHeader {
        &self.header
    }
}

impl ReadAt for Build {
    fn read_at<'a>(
        &'a self,
        buf: &'a mut [u8],
        off: u64,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let mut n = 0usize;
            while n < buf.len() {
                let cur_off = off + n as u64;
                if cur_off >= self.size() {
                    break;
                }
                let (m, shift) = self.header.get_mapping(cur_off)?;
                let source_remaining = m.length - shift;
                if source_remaining == 0 {
                    break;
                }
                let key = format!("{}/{}", m.source_build_id, self.suffix);
                let reader = self.store.get(&key)?;
                let want = (buf.len() - n).min(source_remaining as usize);
                let source_off = m.source_storage_offset + shift;
                let got = reader.read_at(&mut buf[n..n + want], source_off).await?;
                if got == 0 {
                    break;
                }
                n += got;
            }
            Ok(n)
        })
    }

    fn size(&self) -> u64 {
        self.header.metadata.size as u64
    }
}
