//! # curfew
//!
//! Scoped cooperative cancellation for tokio.
//!
//! This crate unifies heterogeneous cancellation triggers — deadlines,
//! manual tokens, OS signals, and arbitrary predicates — behind a single
//! scoped primitive, the [`Operation`]. Cancellation propagates to the task
//! executing inside the scope, to nested child scopes, and to wrapped
//! stream consumers; a thread-safe bridge lets non-async threads cancel
//! async work.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use curfew::{CancelReason, Operation};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let op = Operation::with_deadline(Duration::from_secs(30));
//! let result = op
//!     .run(async {
//!         // Cancellation is delivered at suspension points inside here.
//!         fetch_everything().await
//!     })
//!     .await;
//!
//! match result {
//!     Ok(data) => println!("done: {data:?}"),
//!     Err(err) if err.reason() == Some(CancelReason::Timeout) => {
//!         println!("gave up after 30s");
//!     }
//!     Err(err) => println!("cancelled: {err}"),
//! }
//! # }
//! # async fn fetch_everything() -> Vec<u8> { Vec::new() }
//! ```
//!
//! ## Cancelling from another thread
//!
//! ```rust,no_run
//! use curfew::{CancelReason, CancelToken, Operation};
//!
//! # async fn example() {
//! let token = CancelToken::new();
//! let op = Operation::with_token(token.clone());
//!
//! std::thread::spawn(move || {
//!     // From any OS thread:
//!     token.cancel_sync(CancelReason::Manual, Some("user clicked stop"));
//! });
//!
//! let _ = op.run(async { /* ... */ }).await;
//! # }
//! ```
//!
//! ## The pieces
//!
//! - [`CancelToken`] — the thread-safe one-shot signal everything routes
//!   through; [`LinkedToken`] composes several of them.
//! - [`CancelSource`] implementations ([`DeadlineSource`],
//!   [`PredicateSource`], [`SignalSource`], [`TokenSource`]) fire the
//!   enclosing scope's token; [`AnyOfSource`] / [`AllOfSource`] combine them.
//! - [`Operation`] — the scope: lifecycle, hierarchy, progress callbacks,
//!   shielding, stream wrapping.
//! - [`Registry`] — process-wide lookup, filtered enumeration, glob-matched
//!   bulk cancel, bounded history.
//! - [`current_operation`] — ambient per-task access to the innermost
//!   running scope.
//!
//! ## Cooperative, not preemptive
//!
//! Cancellation is delivered at suspension points: every `await` in the
//! body, every pull from a wrapped stream, every
//! [`report_progress`](Operation::report_progress) call. A body that never
//! suspends cannot be cancelled; offload compute-bound work with
//! [`Operation::run_in_thread`] and check a token inside it.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bridge;
mod context;
mod error;
mod glob;
mod linked;
mod operation;
mod reason;
mod registry;
mod source;
mod state;
mod stream;
mod token;

pub use bridge::{call_soon_threadsafe, run_in_thread, BridgeError};
pub use context::current_operation;
pub use error::{CancelledError, RunError, SourceError, UsageError};
pub use linked::{LinkMode, LinkedToken};
pub use operation::{
    Operation, OperationBuilder, ShieldGuard, DEFAULT_SHUTDOWN_BUDGET,
};
pub use reason::CancelReason;
pub use registry::{OperationFilter, Registry, RegistryStats};
pub use source::{
    signal, ActivationError, AllOfSource, AnyOfSource, CancelSource, DeadlineSource, FireHandle,
    PredicateSource, SignalSource, SourceKind, TokenSource,
};
pub use state::{
    MetaValue, Metadata, OperationSnapshot, OperationStatus, PartialResult, PartialSummary,
    ProgressUpdate,
};
pub use stream::{CancelStream, ChunkStream};
pub use token::{CancelInfo, CancelToken};
