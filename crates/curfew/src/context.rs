//! Ambient per-task access to the innermost running operation.
//!
//! Library code deep in a call stack can ask "am I inside a cancellable
//! operation?" without the operation being threaded through every function:
//!
//! ```rust,no_run
//! use curfew::current_operation;
//!
//! async fn deep_inside_a_library() {
//!     if let Some(op) = current_operation() {
//!         let _ = op.report_progress("indexing", None).await;
//!     }
//! }
//! ```
//!
//! The reference is task-local: concurrent tasks never observe each other's
//! scope, and nested scopes shadow their parents for the duration of the
//! inner `run`. Scoping is done with the runtime's task-local cell inside
//! [`Operation::run`](crate::Operation::run), so the pop happens even when
//! the body is cancelled or unwinds.

use crate::operation::Operation;

tokio::task_local! {
    pub(crate) static CURRENT_OPERATION: Operation;
}

/// The innermost running operation for the current task, if any.
///
/// Returns `None` outside any operation scope — an absent value, not an
/// error.
pub fn current_operation() -> Option<Operation> {
    CURRENT_OPERATION.try_with(|op| op.clone()).ok()
}

/// Run `fut` with `op` installed as the current task's innermost operation.
pub(crate) async fn with_current<F>(op: Operation, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_OPERATION.scope(op, fut).await
}
