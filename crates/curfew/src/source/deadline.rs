//! Deadline-based cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::UsageError;
use crate::reason::CancelReason;
use crate::source::{ActivationError, ActivationSlot, CancelSource, FireHandle, SourceKind};

enum DeadlineSpec {
    After(Duration),
    At(Instant),
}

/// Cancels the enclosing operation when a deadline passes.
///
/// The deadline is computed against the monotonic clock at activation time
/// (for [`after`](Self::after)) or taken as given (for [`at`](Self::at)).
/// A deadline that is already in the past cancels immediately on activation,
/// so the body observes cancellation at its first suspension point.
///
/// ```rust,no_run
/// use curfew::{DeadlineSource, Operation};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), curfew::RunError> {
/// let op = Operation::with_deadline(Duration::from_millis(100));
/// let out = op.run(async { /* slow work */ }).await;
/// # Ok(())
/// # }
/// ```
pub struct DeadlineSource {
    spec: DeadlineSpec,
    computed: Option<Instant>,
    triggered: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
    slot: ActivationSlot,
}

impl DeadlineSource {
    /// Cancel after `duration`, measured from activation.
    pub fn after(duration: Duration) -> Self {
        Self {
            spec: DeadlineSpec::After(duration),
            computed: None,
            triggered: Arc::new(AtomicBool::new(false)),
            monitor: None,
            slot: ActivationSlot::default(),
        }
    }

    /// Cancel after `secs` seconds.
    ///
    /// Errors at construction if `secs` is negative or not a number.
    pub fn after_secs(secs: f64) -> Result<Self, UsageError> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(UsageError::NegativeTimeout(secs));
        }
        Ok(Self::after(Duration::from_secs_f64(secs)))
    }

    /// Cancel at an absolute deadline.
    pub fn at(deadline: Instant) -> Self {
        Self {
            spec: DeadlineSpec::At(deadline),
            computed: None,
            triggered: Arc::new(AtomicBool::new(false)),
            monitor: None,
            slot: ActivationSlot::default(),
        }
    }

    /// The effective deadline, once activated.
    pub fn deadline(&self) -> Option<Instant> {
        self.computed
    }
}

#[async_trait]
impl CancelSource for DeadlineSource {
    fn description(&self) -> String {
        match (&self.spec, self.computed) {
            (DeadlineSpec::After(d), _) => format!("deadline after {d:?}"),
            (DeadlineSpec::At(_), Some(at)) => {
                format!("deadline in {:?}", at.saturating_duration_since(Instant::now()))
            }
            (DeadlineSpec::At(_), None) => "absolute deadline".to_owned(),
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Deadline
    }

    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    async fn activate(&mut self, handle: FireHandle) -> Result<(), ActivationError> {
        self.slot.arm(&self.description())?;

        let now = Instant::now();
        let deadline = match self.spec {
            DeadlineSpec::After(d) => now + d,
            DeadlineSpec::At(at) => at,
        };
        self.computed = Some(deadline);
        handle.set_deadline(deadline);

        let message = match self.spec {
            DeadlineSpec::After(d) => format!("operation timed out after {d:?}"),
            DeadlineSpec::At(_) => "operation deadline elapsed".to_owned(),
        };

        if deadline <= now {
            // Already elapsed: fire here so the body sees cancellation at
            // its first suspension point.
            self.triggered.store(true, Ordering::Release);
            handle.fire(CancelReason::Timeout, &message).await;
            return Ok(());
        }

        debug!(
            operation_id = %handle.operation_id(),
            remaining = ?deadline.saturating_duration_since(now),
            "deadline source activated"
        );

        let triggered = Arc::clone(&self.triggered);
        self.monitor = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            triggered.store(true, Ordering::Release);
            handle.fire(CancelReason::Timeout, &message).await;
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
        debug!(triggered = self.triggered(), "deadline source deactivated");
    }
}

impl Drop for DeadlineSource {
    fn drop(&mut self) {
        // A scope torn down without deactivation must not leave a live
        // monitor behind.
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}
