//! Predicate-polling cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{SourceError, UsageError};
use crate::reason::CancelReason;
use crate::source::{ActivationError, ActivationSlot, CancelSource, FireHandle, SourceKind};

#[derive(Clone)]
enum Predicate {
    Sync(Arc<dyn Fn() -> bool + Send + Sync>),
    Async(Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>),
}

/// Cancels the enclosing operation when a predicate reports `true`.
///
/// The predicate is evaluated every `interval`. Synchronous predicates run on
/// the blocking pool so a slow check never stalls the runtime; async
/// predicates are awaited in place.
///
/// With [`sustained_for`](Self::sustained_for), transient `true` readings are
/// ignored: the predicate must stay `true` continuously for the given window
/// before the source fires, and any `false` reading resets the window.
///
/// ```rust,no_run
/// use curfew::PredicateSource;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let errors = Arc::new(AtomicUsize::new(0));
/// let errors_seen = Arc::clone(&errors);
/// let source = PredicateSource::new(
///     move || errors_seen.load(Ordering::Relaxed) >= 10,
///     Duration::from_millis(100),
/// )
/// .unwrap()
/// .named("error budget");
/// ```
pub struct PredicateSource {
    predicate: Predicate,
    interval: Duration,
    sustained: Option<Duration>,
    name: String,
    triggered: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
    slot: ActivationSlot,
}

impl PredicateSource {
    /// Poll a synchronous predicate every `interval`.
    ///
    /// Errors at construction if `interval` is zero.
    pub fn new<F>(predicate: F, interval: Duration) -> Result<Self, UsageError>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self::build(Predicate::Sync(Arc::new(predicate)), interval)
    }

    /// Poll an async predicate every `interval`.
    ///
    /// Errors at construction if `interval` is zero.
    pub fn new_async<F, Fut>(predicate: F, interval: Duration) -> Result<Self, UsageError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        Self::build(
            Predicate::Async(Arc::new(move || Box::pin(predicate()))),
            interval,
        )
    }

    fn build(predicate: Predicate, interval: Duration) -> Result<Self, UsageError> {
        if interval.is_zero() {
            return Err(UsageError::ZeroInterval);
        }
        Ok(Self {
            predicate,
            interval,
            sustained: None,
            name: "predicate".to_owned(),
            triggered: Arc::new(AtomicBool::new(false)),
            monitor: None,
            slot: ActivationSlot::default(),
        })
    }

    /// Require the predicate to hold continuously for `window` before firing.
    ///
    /// A single `false` reading resets the window.
    pub fn sustained_for(mut self, window: Duration) -> Self {
        self.sustained = Some(window);
        self
    }

    /// Name the predicate for logs and cancellation messages.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl CancelSource for PredicateSource {
    fn description(&self) -> String {
        format!("predicate `{}` every {:?}", self.name, self.interval)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Predicate
    }

    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    async fn activate(&mut self, handle: FireHandle) -> Result<(), ActivationError> {
        self.slot.arm(&self.description())?;

        debug!(
            operation_id = %handle.operation_id(),
            predicate = %self.name,
            interval = ?self.interval,
            sustained = ?self.sustained,
            "predicate source activated"
        );

        let predicate = self.predicate.clone();
        let interval = self.interval;
        let sustained = self.sustained;
        let name = self.name.clone();
        let triggered = Arc::clone(&self.triggered);

        self.monitor = Some(tokio::spawn(async move {
            let mut checks = 0u64;
            let mut true_since: Option<Instant> = None;
            loop {
                tokio::time::sleep(interval).await;
                checks += 1;

                let outcome = match &predicate {
                    Predicate::Async(f) => Some(f().await),
                    Predicate::Sync(f) => {
                        let f = Arc::clone(f);
                        match tokio::task::spawn_blocking(move || f()).await {
                            Ok(value) => Some(value),
                            Err(join_err) => {
                                // A panicking predicate never cancels the
                                // scope; report and keep polling.
                                handle.report_error(SourceError::Monitor {
                                    source_name: format!("predicate `{name}`"),
                                    detail: join_err.to_string(),
                                });
                                None
                            }
                        }
                    }
                };

                match outcome {
                    Some(true) => {
                        let held_long_enough = match sustained {
                            None => true,
                            Some(window) => {
                                let since = *true_since.get_or_insert_with(Instant::now);
                                since.elapsed() >= window
                            }
                        };
                        if held_long_enough {
                            triggered.store(true, Ordering::Release);
                            let message =
                                format!("condition `{name}` met after {checks} checks");
                            handle.fire(CancelReason::Condition, &message).await;
                            return;
                        }
                    }
                    Some(false) => true_since = None,
                    None => {}
                }
            }
        }));

        Ok(())
    }

    async fn deactivate(&mut self) {
        if !self.slot.disarm() {
            return;
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
            let _ = monitor.await;
        }
        debug!(
            predicate = %self.name,
            triggered = self.triggered(),
            "predicate source deactivated"
        );
    }
}

impl Drop for PredicateSource {
    fn drop(&mut self) {
        // A scope torn down without deactivation must not leave the poll
        // loop running.
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}
