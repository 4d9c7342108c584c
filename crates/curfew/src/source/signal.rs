//! OS-signal cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::reason::CancelReason;
use crate::source::{ActivationError, ActivationSlot, CancelSource, FireHandle, SourceKind};

/// SIGINT (interrupt, typically ctrl-c).
pub const SIGINT: i32 = 2;
/// SIGTERM (polite termination request).
pub const SIGTERM: i32 = 15;
/// SIGHUP (terminal hangup).
pub const SIGHUP: i32 = 1;
/// SIGUSR1 (user-defined).
pub const SIGUSR1: i32 = 10;
/// SIGUSR2 (user-defined).
pub const SIGUSR2: i32 = 12;

/// Cancels the enclosing operation when an OS signal arrives.
///
/// On Unix each raw signal number is watched through the runtime's signal
/// streams; handler interest is registered per activation and released on
/// deactivation when the streams are dropped. On other platforms only
/// ctrl-c is available, whatever numbers were requested.
///
/// Signals are delivered on arbitrary threads; the firing path goes through
/// the runtime's signal driver, so cancellation reaches the operation's
/// token safely.
///
/// ```rust,no_run
/// use curfew::{signal, Operation, SignalSource};
///
/// # async fn example() {
/// let op = Operation::with_signals([signal::SIGINT, signal::SIGTERM]);
/// let _ = op.run(async { /* interruptible work */ }).await;
/// # }
/// ```
pub struct SignalSource {
    signals: Vec<i32>,
    triggered: Arc<AtomicBool>,
    monitors: Vec<JoinHandle<()>>,
    slot: ActivationSlot,
}

impl SignalSource {
    /// Watch the given raw signal numbers.
    ///
    /// An empty set defaults to SIGINT and SIGTERM.
    pub fn new(signals: impl IntoIterator<Item = i32>) -> Self {
        let mut signals: Vec<i32> = signals.into_iter().collect();
        if signals.is_empty() {
            signals = vec![SIGINT, SIGTERM];
        }
        Self {
            signals,
            triggered: Arc::new(AtomicBool::new(false)),
            monitors: Vec::new(),
            slot: ActivationSlot::default(),
        }
    }

    /// Watch SIGINT only.
    pub fn interrupt() -> Self {
        Self::new([SIGINT])
    }

    /// The raw signal numbers this source watches.
    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    #[cfg(unix)]
    fn spawn_monitors(&mut self, handle: &FireHandle) -> Result<(), ActivationError> {
        use tokio::signal::unix::{signal, SignalKind};

        for &number in &self.signals {
            let mut stream = signal(SignalKind::from_raw(number)).map_err(|error| {
                crate::error::SourceError::SignalRegistration {
                    signal: number,
                    error,
                }
            })?;

            let triggered = Arc::clone(&self.triggered);
            let handle = handle.clone();
            self.monitors.push(tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    triggered.store(true, Ordering::Release);
                    handle
                        .fire(
                            CancelReason::Signal,
                            &format!("received signal {number}"),
                        )
                        .await;
                }
            }));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn spawn_monitors(&mut self, handle: &FireHandle) -> Result<(), ActivationError> {
        let triggered = Arc::clone(&self.triggered);
        let handle = handle.clone();
        self.monitors.push(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                triggered.store(true, Ordering::Release);
                handle
                    .fire(CancelReason::Signal, "received interrupt")
                    .await;
            }
        }));
        Ok(())
    }
}

#[async_trait]
impl CancelSource for SignalSource {
    fn description(&self) -> String {
        format!("signals {:?}", self.signals)
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Signal
    }

    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    async fn activate(&mut self, handle: FireHandle) -> Result<(), ActivationError> {
        self.slot.arm(&self.description())?;

        if let Err(err) = self.spawn_monitors(&handle) {
            // Roll back any monitors that did start before the failure.
            self.deactivate().await;
            return Err(err);
        }

        debug!(
            operation_id = %handle.operation_id(),
            signals = ?self.signals,
            "signal source activated"
        );
        Ok(())
    }

    async fn deactivate(&mut self) {
        self.slot.disarm();
        // Dropping the streams releases this source's handler interest; the
        // monitors are aborted first so they release promptly.
        for monitor in self.monitors.drain(..) {
            monitor.abort();
            let _ = monitor.await;
        }
        debug!(
            signals = ?self.signals,
            triggered = self.triggered(),
            "signal source deactivated"
        );
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        // A scope torn down without deactivation must not keep signal
        // interest registered.
        for monitor in self.monitors.drain(..) {
            monitor.abort();
        }
    }
}
