//! Error types for cancellation, misuse, and source failures.

use thiserror::Error;

use crate::reason::CancelReason;

fn fmt_detail(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {m}"),
        None => String::new(),
    }
}

/// An operation was cancelled.
///
/// One variant per [`CancelReason`], so synchronous callers can match on the
/// cause directly. Async callers usually get this out of
/// [`Operation::run`](crate::Operation::run) and read
/// [`reason()`](Self::reason) / [`message()`](Self::message).
///
/// ```rust
/// use curfew::{CancelReason, CancelledError};
///
/// let err = CancelledError::new(CancelReason::Timeout, Some("no response"));
/// assert_eq!(err.reason(), CancelReason::Timeout);
/// assert_eq!(err.message(), Some("no response"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CancelledError {
    /// The operation exceeded its deadline.
    #[error("operation timed out{}", fmt_detail(.message))]
    Timeout {
        /// Optional human-readable detail.
        message: Option<String>,
    },

    /// The operation was cancelled explicitly.
    #[error("operation cancelled{}", fmt_detail(.message))]
    Manual {
        /// Optional human-readable detail.
        message: Option<String>,
    },

    /// An OS signal requested cancellation.
    #[error("operation cancelled by signal{}", fmt_detail(.message))]
    Signal {
        /// Optional human-readable detail.
        message: Option<String>,
    },

    /// A monitored predicate requested cancellation.
    #[error("operation cancelled by condition{}", fmt_detail(.message))]
    Condition {
        /// Optional human-readable detail.
        message: Option<String>,
    },

    /// The parent operation was cancelled.
    #[error("operation cancelled by parent{}", fmt_detail(.message))]
    Parent {
        /// Optional human-readable detail.
        message: Option<String>,
    },

    /// The operation was torn down after a non-cancellation failure.
    #[error("operation cancelled after error{}", fmt_detail(.message))]
    Failed {
        /// Optional human-readable detail.
        message: Option<String>,
    },
}

impl CancelledError {
    /// Build the error variant matching `reason`.
    pub fn new(reason: CancelReason, message: Option<&str>) -> Self {
        let message = message.map(str::to_owned);
        match reason {
            CancelReason::Timeout => Self::Timeout { message },
            CancelReason::Manual => Self::Manual { message },
            CancelReason::Signal => Self::Signal { message },
            CancelReason::Condition => Self::Condition { message },
            CancelReason::Parent => Self::Parent { message },
            CancelReason::Error => Self::Failed { message },
        }
    }

    /// The reason this cancellation was requested.
    pub fn reason(&self) -> CancelReason {
        match self {
            Self::Timeout { .. } => CancelReason::Timeout,
            Self::Manual { .. } => CancelReason::Manual,
            Self::Signal { .. } => CancelReason::Signal,
            Self::Condition { .. } => CancelReason::Condition,
            Self::Parent { .. } => CancelReason::Parent,
            Self::Failed { .. } => CancelReason::Error,
        }
    }

    /// The optional human-readable message recorded at cancellation time.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Timeout { message }
            | Self::Manual { message }
            | Self::Signal { message }
            | Self::Condition { message }
            | Self::Parent { message }
            | Self::Failed { message } => message.as_deref(),
        }
    }
}

/// The caller misused the API.
///
/// These are fail-fast errors: they indicate a bug at the call site, not a
/// runtime condition to recover from.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum UsageError {
    /// `run` was called on an operation that has already been entered.
    #[error("operation `{0}` was entered twice")]
    AlreadyEntered(String),

    /// Two operations with the same id were registered globally.
    #[error("operation id `{0}` is already registered")]
    DuplicateId(String),

    /// A source was activated into a second scope.
    ///
    /// Sources are consumed by activation; composition consumes them too.
    #[error("source `{0}` is already activated")]
    SourceReused(String),

    /// A predicate source was constructed with a zero check interval.
    #[error("predicate check interval must be positive")]
    ZeroInterval,

    /// A deadline was constructed from a negative number of seconds.
    #[error("timeout must be non-negative, got {0}")]
    NegativeTimeout(f64),

    /// A composite source was constructed with no children.
    #[error("composite source requires at least one child source")]
    EmptyComposite,

    /// A child operation was entered under a parent that is not running.
    #[error("parent operation `{0}` is not running")]
    ParentNotRunning(String),
}

/// A cancellation source failed to start or monitor.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SourceError {
    /// Registering an OS signal handler failed.
    #[error("failed to register handler for signal {signal}: {error}")]
    SignalRegistration {
        /// The raw signal number.
        signal: i32,
        /// The underlying OS error.
        #[source]
        error: std::io::Error,
    },

    /// A background monitor task failed.
    ///
    /// Monitor failures never cancel or crash the enclosing scope; they are
    /// logged and surfaced to `on_error` callbacks, and the operation
    /// continues without the failed source.
    #[error("source `{source_name}` monitor failed: {detail}")]
    Monitor {
        /// Description of the failing source.
        source_name: String,
        /// What went wrong.
        detail: String,
    },
}

/// Everything that can come out of [`Operation::run`](crate::Operation::run).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The operation was cancelled.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    /// The scope was misused.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// A source failed to activate.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Offloaded blocking work failed to produce a result.
    #[error(transparent)]
    Bridge(#[from] crate::bridge::BridgeError),
}

impl RunError {
    /// Returns `true` if this is a cancellation (as opposed to misuse or a
    /// source activation failure).
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The cancellation reason, if this is a cancellation.
    pub fn reason(&self) -> Option<CancelReason> {
        match self {
            Self::Cancelled(e) => Some(e.reason()),
            _ => None,
        }
    }
}
