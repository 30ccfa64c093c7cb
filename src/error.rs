//! Error kinds for the block store.
//!
//! All fallible functions return [`eyre::Result`] so callers get full
//! context chains; operations whose failure mode is part of the contract
//! (missing block, lock contention, deadline expiry, ...) attach a
//! [`StoreError`] as the root cause. [`StoreError::of`] recovers the kind
//! from a report:
//!
//! ```ignore
//! match store.begin_write(deadline) {
//!     Err(e) if StoreError::of(&e) == Some(StoreError::Timeout) => retry(),
//!     other => other?,
//! }
//! ```

use thiserror::Error;

/// The contractual failure modes of the store. I/O errors from the host
/// propagate as plain `std::io::Error` causes instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store file does not exist, or the block was freed at or
    /// before the requested transaction.
    #[error("block or store not found")]
    NotFound,
    /// Malformed argument: zero block id, tid outside the readable
    /// window, or an unparseable record.
    #[error("invalid argument")]
    Invalid,
    /// The journal's exclusive lock is held by another writer.
    #[error("store is locked by another writer")]
    Busy,
    /// The deadline expired while waiting for the write slot.
    #[error("timed out waiting for the write slot")]
    Timeout,
    /// A mutating operation was invoked on a read-only store.
    #[error("store is read-only")]
    ReadOnly,
    /// The transaction's log buffer would exceed the signed 63-bit
    /// addressable range.
    #[error("transaction too large")]
    Oversize,
    /// An integrity hash did not match (header or checkpoint file), or a
    /// non-tail journal frame is malformed.
    #[error("integrity check failed")]
    Corrupt,
    /// A write-path call without the in-progress write transaction, or
    /// with a stale tid.
    #[error("operation requires the in-progress write transaction")]
    NotWriter,
}

impl StoreError {
    /// Extracts the `StoreError` at the root of a report, if any.
    pub fn of(report: &eyre::Report) -> Option<StoreError> {
        report.downcast_ref::<StoreError>().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context_wrapping() {
        let report: eyre::Report = eyre::Report::new(StoreError::Busy)
            .wrap_err("failed to open journal for 'test.db'");

        assert_eq!(StoreError::of(&report), Some(StoreError::Busy));
    }

    #[test]
    fn foreign_errors_have_no_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let report = eyre::Report::new(io);

        assert_eq!(StoreError::of(&report), None);
    }
}
