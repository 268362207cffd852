use thiserror::Error;

/// Canonical Quarry error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QuarryError::InvalidConfig`]: kernel configuration rejected at construction
/// - [`QuarryError::InvalidDag`]: stage DAG rejected at construction
/// - [`QuarryError::SketchBudgetExceeded`]: partition-statistics sketch outgrew its
///   byte budget; stage-fatal even under fault tolerance
/// - [`QuarryError::WorkerFailure`]: a worker failed; retryable only with fault
///   tolerance and durable storage
/// - [`QuarryError::ShuffleNotFinalized`]: contract violation — a consumer was
///   launched against an unfinalized shuffle spec
/// - [`QuarryError::NotReady`]: queried state is not yet available
/// - [`QuarryError::Internal`]: kernel invariant violation (phase monotonicity,
///   unknown stage/partition ids)
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Invalid or inconsistent kernel configuration.
    ///
    /// Examples:
    /// - zero sketch byte budget or zero concurrent-stage limit
    /// - pipelining combined with fault tolerance or durable storage
    /// - fault tolerance without durable storage
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stage DAG construction failures.
    ///
    /// Examples:
    /// - cycle among stages
    /// - edge referencing an unknown stage id
    /// - duplicate or non-dense stage ids
    #[error("invalid stage dag: {0}")]
    InvalidDag(String),

    /// Partition-statistics sketch exceeded its retained-bytes budget.
    ///
    /// Always stage-fatal: the cardinality assumptions behind the budget were
    /// violated and continuing would produce wrong partition boundaries.
    #[error("sketch budget exceeded: {0}")]
    SketchBudgetExceeded(String),

    /// A worker failed while executing a stage partition.
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// A consumer was launched before its producer's shuffle spec was finalized.
    ///
    /// Must never occur in correct operation; treated as an internal invariant
    /// failure rather than a user-facing error.
    #[error("shuffle spec not finalized: {0}")]
    ShuffleNotFinalized(String),

    /// Requested state is not available yet (poll again later).
    #[error("not ready: {0}")]
    NotReady(String),

    /// Kernel invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Standard Quarry result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;
