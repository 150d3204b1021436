#![forbid(unsafe_code)]
//! Error types for walfs.
//!
//! One user-facing enum covers the whole engine. Propagation policy:
//! allocator and journal errors unwind to the transaction boundary and
//! force an abort; digest errors stop forward progress but never roll
//! back already-applied headers (each application is idempotent and
//! durable on its own).
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | `Io` | Block device read/write failed. Fatal for the in-flight transaction; never retried internally. |
//! | `AllocationFailed` | No free range satisfies the request. Caller must abort, never take a short allocation. |
//! | `LogFull` | Log header entry slots or the reserved block run are exhausted; caller chains a new header or aborts. |
//! | `CorruptLogEntry` | Commit marker or entry count mismatch during digest; replay stops at this header. |
//! | `Corruption` | Structural damage outside the log (bitmap, free list, directory block). |
//! | `Format` | Superblock/geometry validation failure at mount or mkfs. |
//! | `NotFound` | Lookup miss. Expected control flow, not a failure. |
//! | `InvalidState` | API misuse (e.g. append without an active transaction). Fails loudly rather than corrupt state. |

use thiserror::Error;

/// Unified error type for all walfs operations.
#[derive(Debug, Error)]
pub enum WalfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free range in the partition (or the shared overflow list) can
    /// satisfy the requested count.
    #[error("allocation failed: partition {partition}, requested {requested} blocks")]
    AllocationFailed { partition: u32, requested: u64 },

    /// The log header's entry capacity or its reserved block run is
    /// exhausted.
    #[error("log full: {entries} entries used, {blocks_used} of {blocks_reserved} blocks consumed")]
    LogFull {
        entries: usize,
        blocks_used: u64,
        blocks_reserved: u64,
    },

    /// A log header failed validation during digest. Everything before
    /// this header is durable; nothing at or after it is applied.
    #[error("corrupt log entry at block {block}: {detail}")]
    CorruptLogEntry { block: u64, detail: String },

    /// On-disk metadata corruption detected at a known block.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (bad magic, impossible geometry).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Named object not found. Expected control-flow result for lookups.
    #[error("not found: {0}")]
    NotFound(String),

    /// Programming error: an operation was invoked in a state that does
    /// not permit it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// Result alias using `WalfsError`.
pub type Result<T> = std::result::Result<T, WalfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = WalfsError::AllocationFailed {
            partition: 2,
            requested: 16,
        };
        assert_eq!(
            err.to_string(),
            "allocation failed: partition 2, requested 16 blocks"
        );

        let full = WalfsError::LogFull {
            entries: 64,
            blocks_used: 7,
            blocks_reserved: 8,
        };
        assert!(full.to_string().contains("64 entries"));

        let corrupt = WalfsError::CorruptLogEntry {
            block: 900,
            detail: "bad commit magic".into(),
        };
        assert_eq!(
            corrupt.to_string(),
            "corrupt log entry at block 900: bad commit magic"
        );

        let state = WalfsError::InvalidState("append without active transaction");
        assert!(state.to_string().contains("append without"));
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::other("disk gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(WalfsError::Io(_))));
    }
}
