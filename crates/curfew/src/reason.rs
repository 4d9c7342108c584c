//! Cancellation reason type.

use core::fmt;

/// Why an operation was cancelled.
///
/// Every cancellation carries a reason. It is recorded on the
/// [`CancelToken`](crate::CancelToken) at the moment the token fires and is
/// immutable afterwards.
///
/// # Error Integration
///
/// The reason rides along on [`CancelledError`](crate::CancelledError), so
/// callers that only see the error can still branch on the cause:
///
/// ```rust
/// use curfew::CancelReason;
///
/// fn should_retry(reason: CancelReason) -> bool {
///     reason.is_transient()
/// }
///
/// assert!(should_retry(CancelReason::Timeout));
/// assert!(!should_retry(CancelReason::Manual));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CancelReason {
    /// The operation exceeded its deadline.
    Timeout,

    /// Someone explicitly cancelled the operation.
    ///
    /// This typically means `cancel()` was called on the operation or its
    /// token, either from async code or from another thread.
    Manual,

    /// An OS signal (e.g. SIGINT, SIGTERM) requested cancellation.
    Signal,

    /// A monitored predicate reported that the operation should stop.
    Condition,

    /// The parent operation was cancelled and propagated downwards.
    Parent,

    /// A non-cancellation failure caused the operation to be torn down.
    Error,
}

impl CancelReason {
    /// Returns `true` if this is a transient condition that might succeed on
    /// retry.
    ///
    /// Only `Timeout` is considered transient: the operation might succeed
    /// with a longer deadline or under less load. Every other reason
    /// represents an explicit decision or an external event.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns `true` if this was an explicit cancellation.
    #[inline]
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }

    /// Returns `true` if this was a timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns `true` if the cancellation came down from a parent scope.
    #[inline]
    pub fn is_parent(&self) -> bool {
        matches!(self, Self::Parent)
    }

    /// Short lowercase label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Manual => "manual",
            Self::Signal => "signal",
            Self::Condition => "condition",
            Self::Parent => "parent",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "operation timed out"),
            Self::Manual => write!(f, "operation cancelled"),
            Self::Signal => write!(f, "operation cancelled by signal"),
            Self::Condition => write!(f, "operation cancelled by condition"),
            Self::Parent => write!(f, "operation cancelled by parent"),
            Self::Error => write!(f, "operation cancelled after error"),
        }
    }
}
