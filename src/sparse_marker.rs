//! Rebuilds a `Marker` from the hole map of a pre-existing sparse file
//! so a cache reopened after a restart doesn't forget
//! which blocks it already populated.

use std::io;
use std::os::unix::io::RawFd;

use log::debug;
use nix::unistd::{lseek, Whence};

use crate::marker::Marker;

/// `lseek(fd, offset, SEEK_DATA)` / `SEEK_HOLE` wrapper. Returns `None` at
/// EOF (i.e. no more data/hole past `offset`).
fn lseek_whence(fd: RawFd, offset: libc::off_t, whence: Whence) -> io::Result<Option<libc::off_t>> {
    match lseek(fd, offset, whence) {
        Ok(pos) => Ok(Some(pos)),
        // no more data (SEEK_DATA) or file ends without a trailing hole
        // (SEEK_HOLE past the implicit hole at EOF), both mean "done".
        Err(err) if err.as_errno() == Some(nix::errno::Errno::ENXIO) => Ok(None),
        Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
    }
}

fn seek_data(fd: RawFd, offset: libc::off_t) -> io::Result<Option<libc::off_t>> {
    lseek_whence(fd, offset, Whence::SeekData)
}

fn seek_hole(fd: RawFd, offset: libc::off_t) -> io::Result<Option<libc::off_t>> {
    lseek_whence(fd, offset, Whence::SeekHole)
}

/// Scan `fd` for `[data_start, hole_start)` runs starting at `offset` and
/// mark the blocks they cover in `marker`. `file_size` bounds the scan.
pub fn rebuild_marker_from_holes(
    fd: RawFd,
    file_size: u64,
    block_size: u64,
    marker: &Marker,
) -> io::Result<()> {
    let mut pos: i64 = 0;
    loop {
        let data_start = match seek_data(fd, pos)? {
            Some(off) if (off as u64) < file_size => off,
            _ => break,
        };
        let hole_start = match seek_hole(fd, data_start)? {
            Some(off) => off.min(file_size as i64),
            None => file_size as i64,
        };

        let start_block = data_start as u64 / block_size;
        // Only whole blocks that lie fully within the populated run are
        // safe to mark; a run that ends mid-block still has that block's
        // tail written (files are always extended in block-size writes by
        // the cache, so in practice runs align, but we round conservatively
        // regardless).
        let end_block = (hole_start as u64) / block_size;
        if end_block > start_block {
            debug!(
                "sparse marker: marking blocks [{}, {}) from run [{}, {})",
                start_block, end_block, data_start, hole_start
            );
            marker.mark_range(start_block, end_block);
        }

        pos = hole_start;
        if pos as u64 >= file_size {
            break;
        }
    }
    Ok(())
}
