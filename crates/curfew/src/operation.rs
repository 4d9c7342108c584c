//! The scoped operation: a cancellable async region with identity, trigger
//! sources, hierarchy, callbacks, and registry integration.
//!
//! # Example
//!
//! ```rust,no_run
//! use curfew::{CancelReason, Operation};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let op = Operation::with_deadline(Duration::from_millis(100));
//! let result = op
//!     .run(async {
//!         tokio::time::sleep(Duration::from_secs(10)).await;
//!         "done"
//!     })
//!     .await;
//!
//! assert!(result.is_err());
//! assert_eq!(op.reason(), Some(CancelReason::Timeout));
//! # }
//! ```
//!
//! # Lifecycle
//!
//! [`run`](Operation::run) enters the scope (status `Running`, registry
//! registration, source activation — deadlines first — parent linkage,
//! `on_start` callbacks), then races the body against cancellation delivery,
//! then exits (sources deactivated in reverse order, live children cancelled
//! and awaited within the shutdown budget, final status recorded, lifecycle
//! callbacks fired, registry deregistration). The exit bookkeeping runs on
//! every path, including cancellation.
//!
//! # Cancellation delivery
//!
//! Delivery is drop-based, tokio's native cooperative model: when the
//! operation's token fires, the body future is dropped at its next
//! suspension point and `run` returns the cancellation error. A body that
//! never suspends cannot be cancelled — the documented limitation of
//! cooperative cancellation. `Drop` cleanup in the body runs normally.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::with_current;
use crate::error::{CancelledError, RunError, SourceError, UsageError};
use crate::linked::{LinkMode, LinkedToken};
use crate::reason::CancelReason;
use crate::source::{
    ActivationError, CancelSource, DeadlineSource, FireHandle, FireTarget, PredicateSource,
    SignalSource, SourceKind,
};
use crate::state::{
    MetaValue, Metadata, OperationSnapshot, OperationStatus, PartialResult, PartialSummary,
    ProgressUpdate,
};
use crate::token::CancelToken;

/// Default budget for awaiting children during parent teardown.
pub const DEFAULT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

#[derive(Clone)]
enum ProgressCallback {
    Sync(Arc<dyn Fn(&ProgressUpdate) + Send + Sync>),
    Async(Arc<dyn Fn(ProgressUpdate) -> BoxFuture<'static, ()> + Send + Sync>),
}

#[derive(Clone)]
enum LifecycleCallback {
    Sync(Arc<dyn Fn(&OperationSnapshot) + Send + Sync>),
    Async(Arc<dyn Fn(OperationSnapshot) -> BoxFuture<'static, ()> + Send + Sync>),
}

#[derive(Clone)]
enum ErrorCallback {
    Sync(Arc<dyn Fn(&OperationSnapshot, &str) + Send + Sync>),
    Async(Arc<dyn Fn(OperationSnapshot, String) -> BoxFuture<'static, ()> + Send + Sync>),
}

#[derive(Default)]
struct Callbacks {
    progress: Vec<ProgressCallback>,
    start: Vec<LifecycleCallback>,
    complete: Vec<LifecycleCallback>,
    cancel: Vec<LifecycleCallback>,
    error: Vec<ErrorCallback>,
}

#[derive(Clone, Copy)]
enum Stage {
    Start,
    Complete,
    Cancel,
}

struct OpState {
    status: OperationStatus,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    deadline: Option<tokio::time::Instant>,
    sources: Vec<Box<dyn CancelSource>>,
    active_sources: Vec<Box<dyn CancelSource>>,
    children: Vec<Operation>,
    callbacks: Callbacks,
    metadata: Metadata,
    partial: Option<PartialResult>,
    error: Option<String>,
    entered: bool,
}

struct OperationInner {
    id: String,
    name: Option<String>,
    parent_id: Option<String>,
    created_at: Instant,
    token: LinkedToken,
    scope: tokio_util::sync::CancellationToken,
    state: Mutex<OpState>,
    shield: watch::Sender<usize>,
    done: watch::Sender<bool>,
    parent: Option<Weak<OperationInner>>,
    registry: Option<crate::registry::Registry>,
    link_tokens: Vec<CancelToken>,
    shutdown_budget: Duration,
}

/// A scoped cancellable async region.
///
/// Cheap to clone; all clones share state. Construct with [`builder`]
/// (full control) or one of the factories ([`with_deadline`],
/// [`with_token`], [`with_signals`], [`with_predicate`], [`with_sources`]),
/// then execute the guarded region with [`run`] or [`run_result`].
///
/// [`builder`]: Operation::builder
/// [`with_deadline`]: Operation::with_deadline
/// [`with_token`]: Operation::with_token
/// [`with_signals`]: Operation::with_signals
/// [`with_predicate`]: Operation::with_predicate
/// [`with_sources`]: Operation::with_sources
/// [`run`]: Operation::run
/// [`run_result`]: Operation::run_result
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

/// Configures and builds an [`Operation`].
pub struct OperationBuilder {
    id: Option<String>,
    name: Option<String>,
    parent: Option<Operation>,
    token: Option<CancelToken>,
    sources: Vec<Box<dyn CancelSource>>,
    metadata: Metadata,
    register_globally: bool,
    registry: Option<crate::registry::Registry>,
    link_tokens: Vec<CancelToken>,
    shutdown_budget: Duration,
}

impl OperationBuilder {
    fn new() -> Self {
        Self {
            id: None,
            name: None,
            parent: None,
            token: None,
            sources: Vec::new(),
            metadata: HashMap::new(),
            register_globally: true,
            registry: None,
            link_tokens: Vec::new(),
            shutdown_budget: DEFAULT_SHUTDOWN_BUDGET,
        }
    }

    /// Use an explicit operation id instead of a generated one.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set a human-readable name, used in logs and registry glob filters.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Nest this operation under `parent`.
    ///
    /// The parent must be running when the child is entered. Cancelling the
    /// parent cancels this operation with [`CancelReason::Parent`].
    pub fn parent(mut self, parent: &Operation) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Use an externally owned token as this operation's token.
    ///
    /// Cancelling the token cancels the operation; the token's recorded
    /// reason becomes the operation's reason.
    pub fn token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Install a cancellation source.
    pub fn source(mut self, source: impl CancelSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Install an already-boxed cancellation source.
    pub fn boxed_source(mut self, source: Box<dyn CancelSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Attach a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether to register in the process-wide registry (default: yes).
    pub fn register_globally(mut self, register: bool) -> Self {
        self.register_globally = register;
        self
    }

    /// Register in a specific registry instead of the global one.
    ///
    /// Mostly for tests that want registry isolation.
    pub fn registry(mut self, registry: crate::registry::Registry) -> Self {
        self.registry = Some(registry);
        self.register_globally = true;
        self
    }

    /// How long parent teardown waits for each child to exit (default 5s).
    pub fn shutdown_budget(mut self, budget: Duration) -> Self {
        self.shutdown_budget = budget;
        self
    }

    pub(crate) fn link_token(mut self, token: CancelToken) -> Self {
        self.link_tokens.push(token);
        self
    }

    /// Build the operation.
    pub fn build(self) -> Operation {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = match self.token {
            Some(token) => LinkedToken::from_token(token),
            None => LinkedToken::new(),
        };
        let registry = if self.register_globally {
            Some(
                self.registry
                    .unwrap_or_else(|| crate::registry::Registry::global().clone()),
            )
        } else {
            None
        };
        let (shield, _) = watch::channel(0usize);
        let (done, _) = watch::channel(false);

        let op = Operation {
            inner: Arc::new(OperationInner {
                id: id.clone(),
                name: self.name,
                parent_id: self.parent.as_ref().map(|p| p.id().to_owned()),
                created_at: Instant::now(),
                token,
                scope: tokio_util::sync::CancellationToken::new(),
                state: Mutex::new(OpState {
                    status: OperationStatus::Pending,
                    started_at: None,
                    ended_at: None,
                    deadline: None,
                    sources: self.sources,
                    active_sources: Vec::new(),
                    children: Vec::new(),
                    callbacks: Callbacks::default(),
                    metadata: self.metadata,
                    partial: None,
                    error: None,
                    entered: false,
                }),
                shield,
                done,
                parent: self.parent.map(|p| Arc::downgrade(&p.inner)),
                registry,
                link_tokens: self.link_tokens,
                shutdown_budget: self.shutdown_budget,
            }),
        };
        debug!(operation_id = %id, name = op.inner.name.as_deref(), "operation created");
        op
    }
}

impl Operation {
    /// Start configuring an operation.
    pub fn builder() -> OperationBuilder {
        OperationBuilder::new()
    }

    /// An operation with no sources: cancellable only via [`cancel`] or its
    /// token.
    ///
    /// [`cancel`]: Operation::cancel
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// An operation that cancels itself after `deadline`.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self::builder()
            .name(format!("timeout_{deadline:?}"))
            .source(DeadlineSource::after(deadline))
            .build()
    }

    /// An operation that cancels itself after `secs` seconds.
    ///
    /// Errors if `secs` is negative or not a number.
    pub fn with_deadline_secs(secs: f64) -> Result<Self, UsageError> {
        Ok(Self::builder()
            .name(format!("timeout_{secs}s"))
            .source(DeadlineSource::after_secs(secs)?)
            .build())
    }

    /// An operation driven by an externally owned token.
    pub fn with_token(token: CancelToken) -> Self {
        Self::builder().name("token_based").token(token).build()
    }

    /// An operation cancelled by any of the given OS signals.
    pub fn with_signals(signals: impl IntoIterator<Item = i32>) -> Self {
        Self::builder()
            .name("signal_based")
            .source(SignalSource::new(signals))
            .build()
    }

    /// An operation cancelled when `predicate` reports `true`, polled every
    /// `interval`.
    ///
    /// Errors if `interval` is zero.
    pub fn with_predicate<F>(predicate: F, interval: Duration) -> Result<Self, UsageError>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Ok(Self::builder()
            .name("condition_based")
            .source(PredicateSource::new(predicate, interval)?)
            .build())
    }

    /// An operation guarded by a list of sources.
    pub fn with_sources(sources: Vec<Box<dyn CancelSource>>) -> Self {
        let mut builder = Self::builder().name("combined_sources");
        for source in sources {
            builder = builder.boxed_source(source);
        }
        builder.build()
    }

    /// Unique operation id.
    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Human-readable name, if set.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Parent operation id, if constructed under a parent.
    #[inline]
    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent_id.as_deref()
    }

    /// The operation's cancellation token.
    #[inline]
    pub fn token(&self) -> &CancelToken {
        self.inner.token.token()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> OperationStatus {
        self.inner.state.lock().status
    }

    /// Whether the operation's token has fired.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The cancellation reason, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.token.reason()
    }

    /// The cancellation message, once cancelled.
    pub fn message(&self) -> Option<String> {
        self.inner.token.message()
    }

    /// The deadline recorded by a deadline source, if any.
    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.inner.state.lock().deadline
    }

    /// Partial stream output, if a wrapped stream buffered one.
    pub fn partial_result(&self) -> Option<PartialSummary> {
        self.inner.state.lock().partial.as_ref().map(|p| p.summary())
    }

    /// Buffered partial elements at their original type.
    ///
    /// Returns `None` if no stream buffered, or if `T` is not the stream's
    /// element type.
    pub fn partial_items<T: Clone + 'static>(&self) -> Option<Vec<T>> {
        self.inner
            .state
            .lock()
            .partial
            .as_ref()
            .and_then(|p| p.items::<T>().cloned())
    }

    /// A copy of the metadata map.
    pub fn metadata(&self) -> Metadata {
        self.inner.state.lock().metadata.clone()
    }

    /// Insert or replace a metadata entry.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<MetaValue>) {
        self.inner
            .state
            .lock()
            .metadata
            .insert(key.into(), value.into());
    }

    /// An independent copy of the operation's observable state.
    pub fn snapshot(&self) -> OperationSnapshot {
        let state = self.inner.state.lock();
        OperationSnapshot {
            id: self.inner.id.clone(),
            name: self.inner.name.clone(),
            parent_id: self.inner.parent_id.clone(),
            status: state.status,
            created_at: self.inner.created_at,
            started_at: state.started_at,
            ended_at: state.ended_at,
            cancel_reason: self.inner.token.reason(),
            cancel_message: self.inner.token.message(),
            error: state.error.clone(),
            partial: state.partial.as_ref().map(|p| p.summary()),
            metadata: state.metadata.clone(),
        }
    }

    /// Direct children that are still live.
    pub fn children(&self) -> Vec<Operation> {
        self.inner.state.lock().children.clone()
    }

    /// The parent operation, if it is still alive.
    pub fn parent(&self) -> Option<Operation> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Operation { inner })
    }

    // ---- callback registration -------------------------------------------

    /// Register a synchronous progress callback.
    ///
    /// Progress reports fire only callbacks registered on the reporting
    /// operation; they do not bubble to parents.
    pub fn on_progress<F>(&self, callback: F) -> &Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .callbacks
            .progress
            .push(ProgressCallback::Sync(Arc::new(callback)));
        self
    }

    /// Register an async progress callback.
    pub fn on_progress_async<F, Fut>(&self, callback: F) -> &Self
    where
        F: Fn(ProgressUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .state
            .lock()
            .callbacks
            .progress
            .push(ProgressCallback::Async(Arc::new(move |update| {
                Box::pin(callback(update))
            })));
        self
    }

    /// Register a callback fired when the operation starts.
    pub fn on_start<F>(&self, callback: F) -> &Self
    where
        F: Fn(&OperationSnapshot) + Send + Sync + 'static,
    {
        self.push_lifecycle(Stage::Start, LifecycleCallback::Sync(Arc::new(callback)));
        self
    }

    /// Register a callback fired when the operation completes successfully.
    pub fn on_complete<F>(&self, callback: F) -> &Self
    where
        F: Fn(&OperationSnapshot) + Send + Sync + 'static,
    {
        self.push_lifecycle(Stage::Complete, LifecycleCallback::Sync(Arc::new(callback)));
        self
    }

    /// Register a callback fired when the operation exits cancelled.
    pub fn on_cancel<F>(&self, callback: F) -> &Self
    where
        F: Fn(&OperationSnapshot) + Send + Sync + 'static,
    {
        self.push_lifecycle(Stage::Cancel, LifecycleCallback::Sync(Arc::new(callback)));
        self
    }

    /// Register an async callback for one of the lifecycle stages.
    pub fn on_start_async<F, Fut>(&self, callback: F) -> &Self
    where
        F: Fn(OperationSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push_lifecycle(
            Stage::Start,
            LifecycleCallback::Async(Arc::new(move |s| Box::pin(callback(s)))),
        );
        self
    }

    /// Register an async completion callback.
    pub fn on_complete_async<F, Fut>(&self, callback: F) -> &Self
    where
        F: Fn(OperationSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push_lifecycle(
            Stage::Complete,
            LifecycleCallback::Async(Arc::new(move |s| Box::pin(callback(s)))),
        );
        self
    }

    /// Register an async cancellation callback.
    pub fn on_cancel_async<F, Fut>(&self, callback: F) -> &Self
    where
        F: Fn(OperationSnapshot) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.push_lifecycle(
            Stage::Cancel,
            LifecycleCallback::Async(Arc::new(move |s| Box::pin(callback(s)))),
        );
        self
    }

    /// Register a callback fired on failure (body error or source failure).
    ///
    /// Receives the snapshot and the rendered error message.
    pub fn on_error<F>(&self, callback: F) -> &Self
    where
        F: Fn(&OperationSnapshot, &str) + Send + Sync + 'static,
    {
        self.inner
            .state
            .lock()
            .callbacks
            .error
            .push(ErrorCallback::Sync(Arc::new(callback)));
        self
    }

    /// Register an async error callback.
    pub fn on_error_async<F, Fut>(&self, callback: F) -> &Self
    where
        F: Fn(OperationSnapshot, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .state
            .lock()
            .callbacks
            .error
            .push(ErrorCallback::Async(Arc::new(move |s, m| {
                Box::pin(callback(s, m))
            })));
        self
    }

    fn push_lifecycle(&self, stage: Stage, callback: LifecycleCallback) {
        let mut state = self.inner.state.lock();
        let list = match stage {
            Stage::Start => &mut state.callbacks.start,
            Stage::Complete => &mut state.callbacks.complete,
            Stage::Cancel => &mut state.callbacks.cancel,
        };
        list.push(callback);
    }

    // ---- execution -------------------------------------------------------

    /// Enter the scope, run `body` inside it, and exit.
    ///
    /// Returns the body's output, or the cancellation error if the token
    /// fired first. Misuse (double entry, duplicate registry id) and source
    /// activation failures surface as the other [`RunError`] variants.
    ///
    /// If the token fires in the same instant the body completes, the body's
    /// output is still returned but the operation records `Cancelled` — the
    /// status tracks the token, not the race winner.
    pub async fn run<F>(&self, body: F) -> Result<F::Output, RunError>
    where
        F: Future,
    {
        match self.drive(body).await? {
            Some(output) => {
                let kind = if self.is_cancelled() {
                    ExitKind::Cancelled
                } else {
                    ExitKind::Completed
                };
                self.exit(kind).await;
                Ok(output)
            }
            None => {
                self.exit(ExitKind::Cancelled).await;
                Err(self.cancelled_error().into())
            }
        }
    }

    /// Like [`run`](Operation::run) for bodies returning `Result`.
    ///
    /// A body `Err` records status `Failed`, fires `on_error` callbacks, and
    /// comes back as `Ok(Err(e))` — the error stays the caller's own.
    pub async fn run_result<F, T, E>(&self, body: F) -> Result<Result<T, E>, RunError>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match self.drive(body).await? {
            Some(Ok(value)) => {
                let kind = if self.is_cancelled() {
                    ExitKind::Cancelled
                } else {
                    ExitKind::Completed
                };
                self.exit(kind).await;
                Ok(Ok(value))
            }
            Some(Err(error)) => {
                self.exit(ExitKind::Failed(error.to_string())).await;
                Ok(Err(error))
            }
            None => {
                self.exit(ExitKind::Cancelled).await;
                Err(self.cancelled_error().into())
            }
        }
    }

    /// Enter, then race the body against cancellation delivery.
    ///
    /// `Ok(None)` means cancellation won. The caller is responsible for
    /// driving [`exit`](Self::exit).
    async fn drive<F>(&self, body: F) -> Result<Option<F::Output>, RunError>
    where
        F: Future,
    {
        self.enter().await?;
        let guard = ExitGuard {
            op: Some(self.clone()),
        };

        let body = with_current(self.clone(), body);
        tokio::pin!(body);

        let output = tokio::select! {
            biased;
            _ = self.cancel_delivered() => None,
            output = &mut body => Some(output),
        };

        guard.disarm();
        Ok(output)
    }

    /// Resolves once the scope's cancel handle has fired and no shield guard
    /// is held.
    async fn cancel_delivered(&self) {
        self.inner.scope.cancelled().await;
        let mut shield = self.inner.shield.subscribe();
        loop {
            if *shield.borrow_and_update() == 0 {
                return;
            }
            if shield.changed().await.is_err() {
                return;
            }
        }
    }

    async fn enter(&self) -> Result<(), RunError> {
        {
            let mut state = self.inner.state.lock();
            if state.entered {
                return Err(UsageError::AlreadyEntered(self.inner.id.clone()).into());
            }
            state.entered = true;
            state.status = OperationStatus::Running;
            state.started_at = Some(Instant::now());
        }

        self.inner.token.bind_runtime();

        // Token firing raises the scope's cancel handle; the callback is
        // sync and thread-safe, so cross-thread cancellation works too.
        let scope = self.inner.scope.clone();
        self.inner.token.register_callback(move |_| scope.cancel());

        // Hierarchy: require a running parent, join its child list, and wire
        // parent-token firing to this operation.
        if let Some(parent) = self.parent() {
            if !parent.status().is_active() {
                self.inner.state.lock().status = OperationStatus::Pending;
                return Err(UsageError::ParentNotRunning(parent.id().to_owned()).into());
            }
            parent.add_child(self.clone());
            self.inner
                .token
                .link(parent.token(), LinkMode::AsParent)
                .await;
        }

        // Aggregates built by `combine` observe their constituents' tokens.
        for token in &self.inner.link_tokens {
            self.inner.token.link(token, LinkMode::Preserve).await;
        }

        if let Some(registry) = &self.inner.registry {
            if let Err(err) = registry.register(self.clone()) {
                self.unlink_from_parent();
                return Err(err.into());
            }
        }

        if let Err(err) = self.activate_sources().await {
            if let Some(registry) = &self.inner.registry {
                registry.discard(self.id());
            }
            self.unlink_from_parent();
            return Err(err);
        }

        info!(
            operation_id = %self.inner.id,
            name = self.inner.name.as_deref(),
            parent_id = self.inner.parent_id.as_deref(),
            "operation started"
        );

        self.fire_lifecycle(Stage::Start).await;
        Ok(())
    }

    async fn activate_sources(&self) -> Result<(), RunError> {
        let mut sources = std::mem::take(&mut self.inner.state.lock().sources);
        // Deadlines first, otherwise preserve installation order.
        sources.sort_by_key(|s| (s.kind() != SourceKind::Deadline) as u8);

        for index in 0..sources.len() {
            if let Err(err) = sources[index].activate(self.fire_handle()).await {
                for source in sources.iter_mut().take(index).rev() {
                    source.deactivate().await;
                }
                self.inner.state.lock().sources = sources;
                return Err(match err {
                    ActivationError::Usage(e) => RunError::Usage(e),
                    ActivationError::Source(e) => RunError::Source(e),
                });
            }
        }

        self.inner.state.lock().active_sources = sources;
        Ok(())
    }

    async fn exit(&self, kind: ExitKind) {
        // Sources go down first, in reverse activation order, before any
        // terminal status is observable.
        let mut sources = std::mem::take(&mut self.inner.state.lock().active_sources);
        for source in sources.iter_mut().rev() {
            source.deactivate().await;
        }
        // Keep them around so `triggered` flags stay inspectable after exit.
        self.inner.state.lock().sources = sources;

        // Children must not outlive the scope: cancel and await each within
        // the shutdown budget.
        let children = self.children();
        if !children.is_empty() {
            let message = format!("parent operation {} exiting", short_id(self.id()));
            for child in &children {
                child
                    .cancel_with(CancelReason::Parent, Some(&message), true)
                    .await;
            }
            for child in &children {
                if tokio::time::timeout(self.inner.shutdown_budget, child.wait_done())
                    .await
                    .is_err()
                {
                    warn!(
                        operation_id = %self.inner.id,
                        child_id = %child.id(),
                        budget = ?self.inner.shutdown_budget,
                        "child did not exit within shutdown budget"
                    );
                }
            }
        }

        let status = {
            let mut state = self.inner.state.lock();
            state.ended_at = Some(Instant::now());
            state.status = match &kind {
                ExitKind::Completed => OperationStatus::Completed,
                ExitKind::Cancelled => OperationStatus::Cancelled,
                ExitKind::Failed(error) => {
                    state.error = Some(error.clone());
                    OperationStatus::Failed
                }
            };
            state.status
        };

        match kind {
            ExitKind::Completed => self.fire_lifecycle(Stage::Complete).await,
            ExitKind::Cancelled => self.fire_lifecycle(Stage::Cancel).await,
            ExitKind::Failed(error) => self.fire_error(&error).await,
        }

        if let Some(registry) = &self.inner.registry {
            registry.unregister(self.id());
        }
        self.unlink_from_parent();

        info!(
            operation_id = %self.inner.id,
            status = %status,
            reason = self.reason().map(|r| r.as_str()),
            "operation exited"
        );

        let _ = self.inner.done.send(true);
    }

    /// Synchronous teardown for a scope destroyed without running `exit`:
    /// the body panicked, or the whole `run` future was dropped mid-flight
    /// (e.g. an enclosing scope was cancelled). Does the bookkeeping that
    /// must not leak, minus the async parts; monitor tasks are reaped by the
    /// sources' own `Drop` impls.
    fn abandon(&self) {
        let panicked = std::thread::panicking();
        {
            let mut state = self.inner.state.lock();
            state.ended_at = Some(Instant::now());
            if panicked {
                state.status = OperationStatus::Failed;
                state.error = Some("operation body panicked".to_owned());
            } else if self.inner.token.is_cancelled() {
                state.status = OperationStatus::Cancelled;
            } else {
                state.status = OperationStatus::Failed;
                state.error = Some("operation dropped before completion".to_owned());
            }
        }
        if let Some(registry) = &self.inner.registry {
            registry.unregister(self.id());
        }
        self.unlink_from_parent();
        warn!(operation_id = %self.inner.id, panicked, "operation abandoned");
        let _ = self.inner.done.send(true);
    }

    fn add_child(&self, child: Operation) {
        self.inner.state.lock().children.push(child);
    }

    fn remove_child(&self, child_id: &str) {
        self.inner
            .state
            .lock()
            .children
            .retain(|c| c.id() != child_id);
    }

    fn unlink_from_parent(&self) {
        if let Some(parent) = self.parent() {
            parent.remove_child(self.id());
        }
    }

    /// Resolves when the operation has fully exited.
    pub async fn wait_done(&self) {
        let mut done = self.inner.done.subscribe();
        loop {
            if *done.borrow_and_update() {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    // ---- cancellation ----------------------------------------------------

    /// Cancel with [`CancelReason::Manual`], propagating to children.
    pub async fn cancel(&self, message: Option<&str>) {
        self.cancel_with(CancelReason::Manual, message, true).await;
    }

    /// Cancel with an explicit reason.
    ///
    /// With `propagate_to_children`, every live child is cancelled with
    /// [`CancelReason::Parent`] before this call returns, recursively.
    pub async fn cancel_with(
        &self,
        reason: CancelReason,
        message: Option<&str>,
        propagate_to_children: bool,
    ) {
        self.inner.token.cancel(reason, message).await;
        if propagate_to_children {
            self.cancel_children().await;
        }
    }

    /// Cancel from a non-async thread.
    ///
    /// Children are cancelled through the same thread-safe path.
    pub fn cancel_sync(&self, reason: CancelReason, message: Option<&str>) {
        self.inner.token.cancel_sync(reason, message);
        let children = self.children();
        let child_message = format!("parent operation {} cancelled", short_id(self.id()));
        for child in children {
            child.cancel_sync(CancelReason::Parent, Some(&child_message));
        }
    }

    fn cancel_children(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let children = this.children();
            if children.is_empty() {
                return;
            }
            let message = format!("parent operation {} cancelled", short_id(this.id()));
            for child in children {
                child
                    .cancel_with(CancelReason::Parent, Some(&message), true)
                    .await;
            }
        })
    }

    fn cancelled_error(&self) -> CancelledError {
        CancelledError::new(
            self.inner.token.reason().unwrap_or(CancelReason::Manual),
            self.inner.token.message().as_deref(),
        )
    }

    // ---- progress --------------------------------------------------------

    /// Report progress to the callbacks registered on this operation.
    ///
    /// Acts as a cancellation checkpoint: if the token has fired, the
    /// cancellation error is returned before any callback runs. Callbacks
    /// fire in registration order; async callbacks are awaited sequentially.
    /// Callbacks are infallible by signature, so one callback cannot prevent
    /// the rest from running; a panicking callback propagates like any
    /// other panic.
    pub async fn report_progress(
        &self,
        message: &str,
        metadata: Option<Metadata>,
    ) -> Result<(), CancelledError> {
        self.inner.token.check()?;

        let update = ProgressUpdate {
            operation_id: self.inner.id.clone(),
            message: message.to_owned(),
            metadata: metadata.unwrap_or_default(),
        };
        let callbacks = self.inner.state.lock().callbacks.progress.clone();
        for callback in &callbacks {
            match callback {
                ProgressCallback::Sync(f) => f(&update),
                ProgressCallback::Async(f) => f(update.clone()).await,
            }
        }
        Ok(())
    }

    // ---- shielding -------------------------------------------------------

    /// Suppress cancellation delivery while the returned guard is held.
    ///
    /// Suspension points inside the shielded section do not observe the
    /// enclosing cancellation; delivery resumes when the guard drops. The
    /// token itself stays observable via [`CancelToken::check`], so shielded
    /// code may honor it voluntarily. Shielded sections should be short and
    /// bounded — nothing enforces that.
    ///
    /// The operation reports status `Shielded` while any guard is held.
    pub fn shield(&self) -> ShieldGuard {
        self.inner.shield.send_modify(|depth| *depth += 1);
        {
            let mut state = self.inner.state.lock();
            if state.status == OperationStatus::Running {
                state.status = OperationStatus::Shielded;
            }
        }
        ShieldGuard { op: self.clone() }
    }

    // ---- wrapping --------------------------------------------------------

    /// Wrap a callable with a pre-invocation cancellation check.
    ///
    /// The returned closure checks the token synchronously before each call
    /// and delegates on success. Works for async callables too: a closure
    /// returning a future comes back as `Result<Fut, CancelledError>` — check
    /// first, then await.
    ///
    /// ```rust,no_run
    /// use curfew::Operation;
    ///
    /// # fn example(op: &Operation) {
    /// let guarded = op.wrap(|| expensive_step());
    /// while let Ok(value) = guarded() {
    ///     let _ = value;
    /// }
    /// # }
    /// # fn expensive_step() -> u32 { 0 }
    /// ```
    pub fn wrap<F, T>(&self, callable: F) -> impl Fn() -> Result<T, CancelledError>
    where
        F: Fn() -> T,
    {
        let token = self.token().clone();
        move || {
            token.check()?;
            Ok(callable())
        }
    }

    /// Offload blocking work and await it, cancellably.
    ///
    /// Checks the token before spawning, then races the worker's completion
    /// against the token. On cancellation the result is discarded; the
    /// closure keeps running on its worker thread (cooperative cancellation
    /// cannot preempt compute-bound work), so long closures should check a
    /// token themselves.
    pub async fn run_in_thread<F, T>(&self, f: F) -> Result<T, RunError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.token.check()?;
        let join = tokio::task::spawn_blocking(f);
        tokio::select! {
            biased;
            _ = self.inner.token.wait() => Err(self.cancelled_error().into()),
            result = join => match result {
                Ok(value) => Ok(value),
                Err(join_err) => Err(RunError::Bridge(if join_err.is_panic() {
                    crate::bridge::BridgeError::Panicked
                } else {
                    crate::bridge::BridgeError::RuntimeGone
                })),
            },
        }
    }

    // ---- composition -----------------------------------------------------

    /// Combine with another operation into an aggregate scope.
    ///
    /// The aggregate's token is linked to both originals, preserving the
    /// firing side's reason and message. Child scopes may be nested under
    /// the aggregate.
    pub fn combine(&self, other: &Operation) -> Operation {
        let name = format!(
            "combined_{}",
            self.name().unwrap_or_else(|| short_id(self.id()))
        );
        Operation::builder()
            .name(name)
            .metadata("combined", true)
            .link_token(self.token().clone())
            .link_token(other.token().clone())
            .build()
    }

    // ---- internals shared with stream.rs ---------------------------------

    pub(crate) fn store_partial(&self, partial: PartialResult) {
        self.inner.state.lock().partial = Some(partial);
    }

    fn fire_handle(&self) -> FireHandle {
        FireHandle::new(Arc::new(DirectTarget {
            id: self.inner.id.clone(),
            token: self.token().clone(),
            op: Arc::downgrade(&self.inner),
        }))
    }

    async fn fire_lifecycle(&self, stage: Stage) {
        let callbacks = {
            let state = self.inner.state.lock();
            match stage {
                Stage::Start => state.callbacks.start.clone(),
                Stage::Complete => state.callbacks.complete.clone(),
                Stage::Cancel => state.callbacks.cancel.clone(),
            }
        };
        if callbacks.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for callback in &callbacks {
            match callback {
                LifecycleCallback::Sync(f) => f(&snapshot),
                LifecycleCallback::Async(f) => f(snapshot.clone()).await,
            }
        }
    }

    pub(crate) async fn fire_error(&self, message: &str) {
        let callbacks = self.inner.state.lock().callbacks.error.clone();
        if callbacks.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for callback in &callbacks {
            match callback {
                ErrorCallback::Sync(f) => f(&snapshot, message),
                ErrorCallback::Async(f) => f(snapshot.clone(), message.to_owned()).await,
            }
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

enum ExitKind {
    Completed,
    Cancelled,
    Failed(String),
}

/// Cleans up the sync half of exit if the body panics through `run`.
struct ExitGuard {
    op: Option<Operation>,
}

impl ExitGuard {
    fn disarm(mut self) {
        self.op = None;
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            op.abandon();
        }
    }
}

/// Held while a section is shielded from cancellation delivery.
///
/// Dropping the guard re-enables delivery; if the token fired while the
/// shield was held, cancellation arrives at the next suspension point.
#[must_use = "cancellation is only suppressed while the guard is held"]
pub struct ShieldGuard {
    op: Operation,
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        self.op.inner.shield.send_modify(|depth| {
            *depth = depth.saturating_sub(1);
        });
        if *self.op.inner.shield.borrow() == 0 {
            let mut state = self.op.inner.state.lock();
            if state.status == OperationStatus::Shielded {
                state.status = OperationStatus::Running;
            }
        }
    }
}

struct DirectTarget {
    id: String,
    token: CancelToken,
    op: Weak<OperationInner>,
}

impl FireTarget for DirectTarget {
    fn operation_id(&self) -> String {
        self.id.clone()
    }

    fn fire(&self, reason: CancelReason, message: String) -> BoxFuture<'static, ()> {
        let token = self.token.clone();
        Box::pin(async move {
            token.cancel(reason, Some(&message)).await;
        })
    }

    fn fire_sync(&self, reason: CancelReason, message: String) {
        self.token.cancel_sync(reason, Some(&message));
    }

    fn set_deadline(&self, deadline: tokio::time::Instant) {
        if let Some(inner) = self.op.upgrade() {
            inner.state.lock().deadline = Some(deadline);
        }
    }

    fn report_error(&self, error: SourceError) {
        tracing::error!(operation_id = %self.id, error = %error, "source monitor failed");
        if let Some(inner) = self.op.upgrade() {
            let op = Operation { inner };
            let message = error.to_string();
            tokio::spawn(async move {
                op.fire_error(&message).await;
            });
        }
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}
