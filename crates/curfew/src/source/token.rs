//! Cancellation driven by an externally owned token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::reason::CancelReason;
use crate::source::{ActivationError, ActivationSlot, CancelSource, FireHandle, SourceKind};
use crate::token::CancelToken;

/// Cancels the enclosing operation when an external [`CancelToken`] fires.
///
/// The external token stays owned by its creator; this source only observes
/// it. When it fires, the operation is cancelled with
/// [`CancelReason::Manual`] and the external token's message, if any.
///
/// No monitor task is spawned: the source piggybacks on the external token's
/// callback list. Deactivation disarms the callback, so a token firing after
/// the operation has exited does nothing.
pub struct TokenSource {
    token: CancelToken,
    armed: Arc<AtomicBool>,
    triggered: Arc<AtomicBool>,
    slot: ActivationSlot,
}

impl TokenSource {
    /// Observe `token`.
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            armed: Arc::new(AtomicBool::new(false)),
            triggered: Arc::new(AtomicBool::new(false)),
            slot: ActivationSlot::default(),
        }
    }

    /// The observed token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

#[async_trait]
impl CancelSource for TokenSource {
    fn description(&self) -> String {
        format!("external token {}", self.token.id())
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Token
    }

    fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    async fn activate(&mut self, handle: FireHandle) -> Result<(), ActivationError> {
        self.slot.arm(&self.description())?;
        self.armed.store(true, Ordering::Release);

        let armed = Arc::clone(&self.armed);
        let triggered = Arc::clone(&self.triggered);

        debug!(
            operation_id = %handle.operation_id(),
            token_id = %self.token.id(),
            "token source activated"
        );

        self.token
            .register_async_callback(move |info| {
                let armed = Arc::clone(&armed);
                let triggered = Arc::clone(&triggered);
                let handle = handle.clone();
                async move {
                    if !armed.load(Ordering::Acquire) {
                        return;
                    }
                    triggered.store(true, Ordering::Release);
                    let message = info
                        .message
                        .unwrap_or_else(|| "external token cancelled".to_owned());
                    handle.fire(CancelReason::Manual, &message).await;
                }
            })
            .await;

        Ok(())
    }

    async fn deactivate(&mut self) {
        if !self.slot.disarm() {
            return;
        }
        self.armed.store(false, Ordering::Release);
        debug!(
            token_id = %self.token.id(),
            triggered = self.triggered(),
            "token source deactivated"
        );
    }
}
