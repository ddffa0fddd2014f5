//! # Error Taxonomy
//!
//! emberdb reports failures through [`eyre::Result`], the same reporting
//! backbone used across the codebase for context chaining via `wrap_err`.
//! The closed set of engine failure conditions is the [`ErrorKind`] enum:
//! any operation that fails for a reason a caller can act on attaches an
//! `ErrorKind` as the root cause of the report.
//!
//! Callers (and the test suite) recover the kind with
//! [`ErrorKind::of`]:
//!
//! ```ignore
//! match db.find(None, b"missing") {
//!     Err(report) if ErrorKind::of(&report) == Some(ErrorKind::KeyNotFound) => { /* ... */ }
//!     other => { /* ... */ }
//! }
//! ```
//!
//! I/O failures surface as `ErrorKind::Io` wrapping the underlying
//! `std::io::Error` in the report chain; structural invariant violations
//! (node over/underflow, freelist corruption) are `debug_assert!`ed and
//! reported as plain `eyre` reports without a kind, since no caller can
//! meaningfully handle them.

use thiserror::Error;

/// Engine failure conditions exposed to callers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("cursor is not positioned")]
    CursorIsNil,
    #[error("key was erased in this transaction")]
    KeyErasedInTxn,

    #[error("invalid key size")]
    InvKeySize,
    #[error("invalid record size")]
    InvRecordSize,
    #[error("invalid page size")]
    InvPageSize,
    #[error("invalid parameter")]
    InvParameter,

    #[error("i/o error")]
    Io,
    #[error("file not found")]
    FileNotFound,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation would block")]
    WouldBlock,
    #[error("a hard limit was reached")]
    LimitsReached,

    #[error("environment needs recovery")]
    NeedRecovery,
    #[error("invalid journal file header")]
    LogInvFileHeader,

    #[error("transaction conflict")]
    TxnConflict,
    #[error("transaction is still open")]
    TxnStillOpen,
}

impl ErrorKind {
    /// Extracts the engine error kind from a report, if the failure carries
    /// one. Checks both context objects and the underlying cause chain, so
    /// the kind is found no matter how much `wrap_err` context sits above it.
    pub fn of(report: &eyre::Report) -> Option<ErrorKind> {
        report.downcast_ref::<ErrorKind>().copied().or_else(|| {
            report
                .chain()
                .find_map(|cause| cause.downcast_ref::<ErrorKind>())
                .copied()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn kind_survives_context_wrapping() {
        let report: eyre::Report = ErrorKind::KeyNotFound.into();
        let wrapped = Err::<(), _>(report)
            .wrap_err("while looking up \"alpha\"")
            .unwrap_err();

        assert_eq!(ErrorKind::of(&wrapped), Some(ErrorKind::KeyNotFound));
    }

    #[test]
    fn reports_without_a_kind_yield_none() {
        let report = eyre::eyre!("freelist trunk count exceeds capacity");
        assert_eq!(ErrorKind::of(&report), None);
    }

    #[test]
    fn io_kind_wraps_underlying_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let report = eyre::Report::new(io).wrap_err(ErrorKind::Io);
        assert_eq!(ErrorKind::of(&report), Some(ErrorKind::Io));
    }
}
