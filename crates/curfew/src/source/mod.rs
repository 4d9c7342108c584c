//! Cancellation trigger sources.
//!
//! A source watches for one condition — a deadline, a predicate turning
//! true, an OS signal, an external token — and fires the enclosing
//! operation's cancellation when it occurs. Sources are installed on an
//! [`Operation`](crate::Operation) before it runs, activated on entry, and
//! deactivated (in reverse order) on exit.
//!
//! Composition is provided by [`AnyOfSource`] (first child to fire wins) and
//! [`AllOfSource`] (fires only when every child has fired).
//!
//! Activation consumes a source: activating the same source into a second
//! scope is a usage error.

mod composite;
mod deadline;
mod predicate;
pub mod signal;
mod token;

pub use composite::{AllOfSource, AnyOfSource};
pub use deadline::DeadlineSource;
pub use predicate::PredicateSource;
pub use signal::SignalSource;
pub use token::TokenSource;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::error::{SourceError, UsageError};
use crate::reason::CancelReason;

/// Why a source could not be activated.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ActivationError {
    /// The source was used incorrectly (e.g. activated twice).
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The source failed to acquire a runtime resource.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Coarse classification of a source, used for activation ordering
/// (deadlines are activated first) and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SourceKind {
    /// A deadline or timeout.
    Deadline,
    /// A polled predicate.
    Predicate,
    /// An OS signal.
    Signal,
    /// An externally owned token.
    Token,
    /// A composite of other sources.
    Composite,
}

/// A cancellation trigger installable on an operation.
///
/// Implementations must clean up every runtime resource they acquired
/// (monitor tasks, signal handler interest) in [`deactivate`], and
/// `deactivate` must be idempotent.
#[async_trait]
pub trait CancelSource: Send + Sync {
    /// Human-readable description, used in logs and error messages.
    fn description(&self) -> String;

    /// The source's classification.
    fn kind(&self) -> SourceKind;

    /// Whether this source has fired.
    fn triggered(&self) -> bool;

    /// Attach to an operation and begin monitoring.
    ///
    /// `handle` is how the source fires: it routes to the operation's token
    /// (or, under a composite, to the composite's own accounting).
    async fn activate(&mut self, handle: FireHandle) -> Result<(), ActivationError>;

    /// Stop monitoring and release resources. Idempotent.
    async fn deactivate(&mut self);
}

/// Where a [`FireHandle`] routes its firing.
///
/// The direct target (built by the operation on entry) cancels the
/// operation's token. Composite sources substitute their own targets to
/// intercept child firings.
pub(crate) trait FireTarget: Send + Sync {
    fn operation_id(&self) -> String;
    fn fire(&self, reason: CancelReason, message: String) -> BoxFuture<'static, ()>;
    fn fire_sync(&self, reason: CancelReason, message: String);
    fn set_deadline(&self, deadline: tokio::time::Instant);
    fn report_error(&self, error: SourceError);
}

/// The firing side of a source activation.
///
/// Handed to [`CancelSource::activate`]; cheap to clone into monitor tasks.
#[derive(Clone)]
pub struct FireHandle {
    target: Arc<dyn FireTarget>,
}

impl FireHandle {
    pub(crate) fn new(target: Arc<dyn FireTarget>) -> Self {
        Self { target }
    }

    /// Id of the operation this activation belongs to.
    pub fn operation_id(&self) -> String {
        self.target.operation_id()
    }

    /// Fire the source: request cancellation with `reason` and `message`.
    ///
    /// Idempotent through the token's one-shot semantics.
    pub async fn fire(&self, reason: CancelReason, message: &str) {
        self.target.fire(reason, message.to_owned()).await;
    }

    /// Thread-safe variant of [`fire`](Self::fire) for triggers that
    /// originate off the runtime (signal handlers, watcher threads).
    pub fn fire_sync(&self, reason: CancelReason, message: &str) {
        self.target.fire_sync(reason, message.to_owned());
    }

    /// Record a deadline on the enclosing scope, for introspection.
    pub fn set_deadline(&self, deadline: tokio::time::Instant) {
        self.target.set_deadline(deadline);
    }

    /// Report a monitor failure without cancelling the operation.
    ///
    /// The failure is logged and delivered to the operation's `on_error`
    /// callbacks; the operation continues without the failed source.
    pub fn report_error(&self, error: SourceError) {
        self.target.report_error(error);
    }
}

impl std::fmt::Debug for FireHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FireHandle")
            .field("operation_id", &self.target.operation_id())
            .finish()
    }
}

/// One-shot activation latch shared by all source implementations.
#[derive(Debug, Default)]
pub(crate) struct ActivationSlot {
    active: bool,
}

impl ActivationSlot {
    /// Mark the source active; errors if it already is.
    pub(crate) fn arm(&mut self, description: &str) -> Result<(), UsageError> {
        if self.active {
            return Err(UsageError::SourceReused(description.to_owned()));
        }
        self.active = true;
        Ok(())
    }

    /// Mark the source inactive; returns whether it was active.
    pub(crate) fn disarm(&mut self) -> bool {
        std::mem::take(&mut self.active)
    }
}
