use thiserror::Error;

use crate::read_write::BucketId;

/// Error taxonomy for the re-execution engine (see spec §7).
///
/// Transaction-level EVM errors are *not* a variant here: a reverted
/// transaction is recorded in [`crate::TxTask::error`] and is not a failure
/// of the engine. Only conditions that abort a worker, the collector, or the
/// whole run are represented.
#[derive(Debug, Error)]
pub enum ReconError {
    /// The read-set of a re-queued task was found stale during validation.
    /// Non-fatal: the collector re-queues the task for re-execution.
    #[error("stale read detected, task must re-execute")]
    StaleRead,

    /// I/O error reading a segment file or a KV transaction. Fatal.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A documented invariant was violated (heap out of order, missing body,
    /// tx count mismatch between segments). Fatal; indicates corrupted input.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A bucket was referenced that the KV backend does not know about.
    #[error("unknown bucket: {0:?}")]
    UnknownBucket(BucketId),

    /// The user requested a clean shutdown (Ctrl-C at the next block
    /// boundary). Not an error from the caller's perspective; carried through
    /// the `Result` machinery so the driver can short-circuit cleanly.
    #[error("interrupted by user")]
    Interrupted,
}

pub type ReconResult<T> = Result<T, ReconError>;
