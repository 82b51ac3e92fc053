//! Streams the dirty blocks of a device to a sink in ascending order,
//! used to persist a new build layer from a sandbox's writes.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::marker::Marker;
use crate::read_at::ReadAt;

/// Reads one block at a time from `source` for every bit set in `dirty`
/// and appends it to `sink`, in ascending block order. The sink's own
/// framing (raw data vs. data plus a companion header) is the caller's
/// concern; this only guarantees block order and block boundaries.
pub async fn create_diff<W>(
    source: Arc<dyn ReadAt>,
    block_size: u64,
    dirty: &Marker,
    num_blocks: u64,
    sink: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; block_size as usize];
    for b in 0..num_blocks {
        if !dirty.is_marked(b) {
            continue;
        }
        let off = b * block_size;
        let n = source.read_at(&mut buf, off).await?;
        sink.write_all(&buf[..n]).await?;
    }
    Ok(())
}

/// `create_diff`, wrapped in `anyhow` for callers outside this crate (the
/// sandbox-cache layer persisting a new build layer) that don't want to
/// match on `BlockDeviceError` themselves. Mirrors the teacher's own
/// `local enum wrapped by anyhow at the edges` convention for outermost
/// public helpers.
pub async fn create_diff_anyhow<W>(
    source: Arc<dyn ReadAt>,
    block_size: u64,
    dirty: &Marker,
    num_blocks: u64,
    sink: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    create_diff(source, block_size, dirty, num_blocks, sink)
        .await
        .map_err(anyhow::Error::from)
}
