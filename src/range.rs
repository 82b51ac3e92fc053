//! Offset/length to block-index and chunk-index arithmetic.
//!
//! Factored out because both the Mmap Cache (marking/checking blocks) and the
//! Chunker (computing which chunks a read needs) do the same ceiling-div
//! math; keeping it in one place means the edge cases (zero-length reads,
//! reads ending exactly on a boundary) only need to be gotten right once.

/// Inclusive-exclusive block index range `[start, end)` covered by
/// `[off, off + len)` at the given block size. A zero-length read at `off`
/// still covers the single block containing `off`.
pub fn block_range(off: u64, len: u64, block_size: u64) -> (u64, u64) {
    let start = off / block_size;
    let last_byte = off + len.max(1) - 1;
    let end = last_byte / block_size + 1;
    (start, end)
}

/// Chunk indices covered by `[off, off + len)` at the given chunk size.
/// A zero-length read is treated as covering the single chunk containing
/// `off` (the prefetch-hint convention used by the Chunker).
pub fn chunk_range(off: u64, len: u64, chunk_size: u64) -> (u64, u64) {
    let start = off / chunk_size;
    let last_byte = off + len.max(1) - 1;
    let end = last_byte / chunk_size + 1;
    (start, end)
}

pub fn chunk_index(off: u64, chunk_size: u64) -> u64 {
    off / chunk_size
}

/// Number of chunks needed to cover a device of `size` bytes.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    if size == 0 {
        0
    } else {
        (size + chunk_size - 1) / chunk_size
    }
}

/// Length in bytes of chunk `idx` given the total logical `size`; the
/// final chunk may be shorter than `chunk_size` when the device size isn't
/// chunk-aligned.
pub fn chunk_len(idx: u64, size: u64, chunk_size: u64) -> u64 {
    let start = idx * chunk_size;
    if start >= size {
        0
    } else {
        (size - start).min(chunk_size)
    }
}
