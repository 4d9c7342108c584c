//! Operation status, snapshots, metadata values, and partial results.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::reason::CancelReason;

/// Lifecycle state of an [`Operation`](crate::Operation).
///
/// Legal transitions: `Pending → Running`,
/// `Running → {Completed, Cancelled, Failed}`, and `Running ↔ Shielded`
/// while a shield guard is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OperationStatus {
    /// Constructed but not yet entered.
    Pending,
    /// Entered and executing.
    Running,
    /// Exited without cancellation or error.
    Completed,
    /// Exited because its token fired.
    Cancelled,
    /// Exited with a non-cancellation error.
    Failed,
    /// Currently inside a shield block (reverts to `Running` on release).
    Shielded,
}

impl OperationStatus {
    /// Whether the operation has finished (successfully or not).
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether the operation is currently executing.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Shielded)
    }

    /// Short lowercase label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Shielded => "shielded",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metadata or progress value.
///
/// Metadata maps are string-keyed with a small closed set of scalar value
/// shapes, so callbacks and registry snapshots can carry heterogeneous
/// values without resorting to `Any`.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum MetaValue {
    /// A string value.
    Str(String),
    /// An integer value.
    Int(i64),
    /// A floating-point value (e.g. a `progress` percentage).
    Float(f64),
    /// A boolean value.
    Bool(bool),
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for MetaValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(v) => f.write_str(v),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A string-keyed metadata map.
pub type Metadata = HashMap<String, MetaValue>;

/// What progress callbacks receive.
///
/// Recognized (advisory, all optional) metadata keys: `progress` (0–100
/// float), `current`, `total`, `rate`, `eta`, `phase`.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Id of the reporting operation.
    pub operation_id: String,
    /// Free-form progress message.
    pub message: String,
    /// Optional structured detail.
    pub metadata: Metadata,
}

/// Summary of a stream's partial output, preserved through cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialSummary {
    /// How many elements were produced before the stream stopped.
    pub count: usize,
    /// Whether the stream ran to completion.
    pub completed: bool,
}

/// Buffered partial output of a wrapped stream.
///
/// The buffered elements are type-erased; recover them with
/// [`items`](Self::items) at the element type the stream produced.
pub struct PartialResult {
    pub(crate) summary: PartialSummary,
    pub(crate) items: Option<Box<dyn Any + Send + Sync>>,
}

impl PartialResult {
    /// Count and completion flag.
    #[inline]
    pub fn summary(&self) -> PartialSummary {
        self.summary
    }

    /// The buffered elements, if buffering was enabled and `T` matches the
    /// stream's element type.
    pub fn items<T: 'static>(&self) -> Option<&Vec<T>> {
        self.items.as_ref()?.downcast_ref()
    }
}

impl fmt::Debug for PartialResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialResult")
            .field("count", &self.summary.count)
            .field("completed", &self.summary.completed)
            .field("buffered", &self.items.is_some())
            .finish()
    }
}

/// An immutable copy of an operation's observable state.
///
/// Snapshots are what the [`Registry`](crate::Registry) hands out and what
/// lifecycle callbacks receive: independent copies, safe to hold across
/// awaits and after the operation exits.
#[derive(Debug, Clone)]
pub struct OperationSnapshot {
    /// Unique operation id.
    pub id: String,
    /// Human-readable name, if set.
    pub name: Option<String>,
    /// Parent operation id, if constructed under a parent.
    pub parent_id: Option<String>,
    /// Lifecycle status at snapshot time.
    pub status: OperationStatus,
    /// When the operation was constructed.
    pub created_at: Instant,
    /// When the operation was entered, if it has been.
    pub started_at: Option<Instant>,
    /// When the operation exited, if it has.
    pub ended_at: Option<Instant>,
    /// Why the operation was cancelled, if it was.
    pub cancel_reason: Option<CancelReason>,
    /// The cancellation message, if any.
    pub cancel_message: Option<String>,
    /// The failure message, if the operation failed.
    pub error: Option<String>,
    /// Partial stream output summary, if any stream buffered one.
    pub partial: Option<PartialSummary>,
    /// Caller-supplied metadata.
    pub metadata: Metadata,
}

impl OperationSnapshot {
    /// Time since construction.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Wall time between entry and exit, if both happened.
    pub fn duration(&self) -> Option<Duration> {
        Some(self.ended_at?.duration_since(self.started_at?))
    }

    /// Whether the snapshot shows a finished operation.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
