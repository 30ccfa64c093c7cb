//! Run-length diff codec between two block images.
//!
//! A diff is a sequence of little-endian 16-bit markers. A marker with
//! the high bit clear means "the next N bytes equal the base image" and
//! carries no literals; a marker with the high bit set means "the next N
//! bytes are literal" and is followed by exactly N bytes. Run lengths
//! over the whole payload sum to the block size. Zero-length literal
//! runs are forbidden; zero-length equal runs are never emitted.
//!
//! Encoding scans both images in lockstep, alternating equal and
//! differing runs, so the payload for an unchanged block is a single
//! marker and the payload for a rewritten block is one marker plus the
//! full image.

use eyre::Result;

use crate::config::BLOCK_SIZE;
use crate::error::StoreError;

/// Marker bit distinguishing literal runs from equal runs.
const LITERAL: u16 = 0x8000;

/// Longest run a single marker can describe.
const MAX_RUN: usize = 0x7FFF;

const _: () = assert!(BLOCK_SIZE <= MAX_RUN, "one marker must be able to span a block");

/// Appends the diff of `old -> new` to `out`. Fails with
/// [`StoreError::Oversize`] if `out` would grow beyond the signed 63-bit
/// addressable range.
pub fn encode(old: &[u8; BLOCK_SIZE], new: &[u8; BLOCK_SIZE], out: &mut Vec<u8>) -> Result<()> {
    let mut pos = 0;
    while pos < BLOCK_SIZE {
        let equal = run_len(old, new, pos, true);
        if equal > 0 {
            push_marker(out, equal as u16)?;
            pos += equal;
        }

        let changed = run_len(old, new, pos, false);
        if changed > 0 {
            push_marker(out, changed as u16 | LITERAL)?;
            reserve(out.len(), changed)?;
            out.extend_from_slice(&new[pos..pos + changed]);
            pos += changed;
        }
    }
    Ok(())
}

/// Length of the run starting at `pos` where byte equality matches
/// `want_equal`.
fn run_len(old: &[u8; BLOCK_SIZE], new: &[u8; BLOCK_SIZE], pos: usize, want_equal: bool) -> usize {
    let mut end = pos;
    while end < BLOCK_SIZE && (old[end] == new[end]) == want_equal {
        end += 1;
    }
    end - pos
}

fn push_marker(out: &mut Vec<u8>, marker: u16) -> Result<()> {
    reserve(out.len(), 2)?;
    out.extend_from_slice(&marker.to_le_bytes());
    Ok(())
}

fn reserve(len: usize, extra: usize) -> Result<()> {
    if len as u64 + extra as u64 > i64::MAX as u64 {
        return Err(eyre::Report::new(StoreError::Oversize));
    }
    Ok(())
}

/// Applies a diff payload onto `image` in place. The payload must cover
/// exactly [`BLOCK_SIZE`] bytes; anything else is [`StoreError::Invalid`].
pub fn apply(image: &mut [u8; BLOCK_SIZE], payload: &[u8]) -> Result<()> {
    let mut cursor = 0;
    let mut pos = 0;

    while cursor < payload.len() {
        if cursor + 2 > payload.len() {
            return Err(eyre::Report::new(StoreError::Invalid)
                .wrap_err("diff payload ends inside a run marker"));
        }
        let marker = u16::from_le_bytes([payload[cursor], payload[cursor + 1]]);
        cursor += 2;

        let len = (marker & !LITERAL) as usize;
        if pos + len > BLOCK_SIZE {
            return Err(eyre::Report::new(StoreError::Invalid)
                .wrap_err("diff runs overrun the block"));
        }

        if marker & LITERAL != 0 {
            if len == 0 {
                return Err(eyre::Report::new(StoreError::Invalid)
                    .wrap_err("zero-length literal run"));
            }
            if cursor + len > payload.len() {
                return Err(eyre::Report::new(StoreError::Invalid)
                    .wrap_err("diff payload ends inside a literal run"));
            }
            image[pos..pos + len].copy_from_slice(&payload[cursor..cursor + len]);
            cursor += len;
        }
        pos += len;
    }

    if pos != BLOCK_SIZE {
        return Err(eyre::Report::new(StoreError::Invalid)
            .wrap_err(format!("diff runs cover {} of {} bytes", pos, BLOCK_SIZE)));
    }
    Ok(())
}
