//! Source combinators: any-of and all-of.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{SourceError, UsageError};
use crate::reason::CancelReason;
use crate::source::{
    ActivationError, ActivationSlot, CancelSource, FireHandle, FireTarget, SourceKind,
};

/// Fires when the first of its children fires.
///
/// The winning child's reason and message become the operation's reason and
/// message — the token's one-shot semantics make every later child a no-op.
/// Which child won is recorded and queryable via
/// [`fired_child`](Self::fired_child).
///
/// Children are consumed by the composite and must not have been activated
/// before; the composite activates and deactivates them as a unit.
pub struct AnyOfSource {
    children: Vec<Box<dyn CancelSource>>,
    winner: Arc<Mutex<Option<usize>>>,
    slot: ActivationSlot,
}

impl AnyOfSource {
    /// Combine `children`; errors if the list is empty.
    pub fn new(children: Vec<Box<dyn CancelSource>>) -> Result<Self, UsageError> {
        if children.is_empty() {
            return Err(UsageError::EmptyComposite);
        }
        Ok(Self {
            children,
            winner: Arc::new(Mutex::new(None)),
            slot: ActivationSlot::default(),
        })
    }

    /// Index of the child that fired first, if any.
    pub fn fired_child(&self) -> Option<usize> {
        *self.winner.lock()
    }

    /// Description of the child that fired first, if any.
    pub fn fired_description(&self) -> Option<String> {
        self.fired_child()
            .and_then(|i| self.children.get(i))
            .map(|c| c.description())
    }
}

struct AnyOfChildTarget {
    outer: FireHandle,
    winner: Arc<Mutex<Option<usize>>>,
    index: usize,
}

impl AnyOfChildTarget {
    fn record(&self) {
        let mut winner = self.winner.lock();
        if winner.is_none() {
            *winner = Some(self.index);
        }
    }
}

impl FireTarget for AnyOfChildTarget {
    fn operation_id(&self) -> String {
        self.outer.operation_id()
    }

    fn fire(&self, reason: CancelReason, message: String) -> BoxFuture<'static, ()> {
        self.record();
        let outer = self.outer.clone();
        Box::pin(async move {
            outer.fire(reason, &message).await;
        })
    }

    fn fire_sync(&self, reason: CancelReason, message: String) {
        self.record();
        self.outer.fire_sync(reason, &message);
    }

    fn set_deadline(&self, deadline: tokio::time::Instant) {
        self.outer.set_deadline(deadline);
    }

    fn report_error(&self, error: SourceError) {
        self.outer.report_error(error);
    }
}

#[async_trait]
impl CancelSource for AnyOfSource {
    fn description(&self) -> String {
        let children: Vec<String> = self.children.iter().map(|c| c.description()).collect();
        format!("any of [{}]", children.join(", "))
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Composite
    }

    fn triggered(&self) -> bool {
        self.winner.lock().is_some()
    }

    async fn activate(&mut self, handle: FireHandle) -> Result<(), ActivationError> {
        self.slot.arm(&self.description())?;

        for index in 0..self.children.len() {
            let target = AnyOfChildTarget {
                outer: handle.clone(),
                winner: Arc::clone(&self.winner),
                index,
            };
            if let Err(err) = self.children[index]
                .activate(FireHandle::new(Arc::new(target)))
                .await
            {
                // Unwind the part of the composite that did start.
                for started in self.children.iter_mut().take(index).rev() {
                    started.deactivate().await;
                }
                self.slot.disarm();
                return Err(err);
            }
        }

        debug!(
            operation_id = %handle.operation_id(),
            children = self.children.len(),
            "any-of source activated"
        );
        Ok(())
    }

    async fn deactivate(&mut self) {
        if !self.slot.disarm() {
            return;
        }
        for child in self.children.iter_mut().rev() {
            child.deactivate().await;
        }
        debug!(fired_child = ?self.fired_child(), "any-of source deactivated");
    }
}

/// Fires only when every child has fired.
///
/// A child firing does not cancel the operation; it is recorded in a
/// lock-guarded arrival list. When the last child arrives, the composite
/// fires with [`CancelReason::Condition`] and a message listing every
/// contributing reason in arrival order.
pub struct AllOfSource {
    children: Vec<Box<dyn CancelSource>>,
    shared: Arc<AllOfShared>,
    slot: ActivationSlot,
}

struct AllOfShared {
    total: usize,
    arrivals: Mutex<Vec<Arrival>>,
    fired: AtomicBool,
}

struct Arrival {
    index: usize,
    reason: CancelReason,
    message: String,
}

impl AllOfSource {
    /// Combine `children`; errors if the list is empty.
    pub fn new(children: Vec<Box<dyn CancelSource>>) -> Result<Self, UsageError> {
        if children.is_empty() {
            return Err(UsageError::EmptyComposite);
        }
        let total = children.len();
        Ok(Self {
            children,
            shared: Arc::new(AllOfShared {
                total,
                arrivals: Mutex::new(Vec::new()),
                fired: AtomicBool::new(false),
            }),
            slot: ActivationSlot::default(),
        })
    }

    /// How many children have fired so far.
    pub fn arrived(&self) -> usize {
        self.shared.arrivals.lock().len()
    }
}

struct AllOfChildTarget {
    outer: FireHandle,
    shared: Arc<AllOfShared>,
    index: usize,
}

impl AllOfChildTarget {
    /// Record one child's arrival; returns the combined firing message when
    /// this arrival completes the set.
    fn arrive(&self, reason: CancelReason, message: String) -> Option<String> {
        let mut arrivals = self.shared.arrivals.lock();
        if arrivals.iter().any(|a| a.index == self.index) {
            return None;
        }
        arrivals.push(Arrival {
            index: self.index,
            reason,
            message,
        });
        if arrivals.len() < self.shared.total {
            return None;
        }
        if self.shared.fired.swap(true, Ordering::AcqRel) {
            return None;
        }
        let parts: Vec<String> = arrivals
            .iter()
            .map(|a| format!("{}: {}", a.reason.as_str(), a.message))
            .collect();
        Some(format!(
            "all {} sources triggered ({})",
            self.shared.total,
            parts.join("; ")
        ))
    }
}

impl FireTarget for AllOfChildTarget {
    fn operation_id(&self) -> String {
        self.outer.operation_id()
    }

    fn fire(&self, reason: CancelReason, message: String) -> BoxFuture<'static, ()> {
        let combined = self.arrive(reason, message);
        let outer = self.outer.clone();
        Box::pin(async move {
            if let Some(message) = combined {
                outer.fire(CancelReason::Condition, &message).await;
            }
        })
    }

    fn fire_sync(&self, reason: CancelReason, message: String) {
        if let Some(combined) = self.arrive(reason, message) {
            self.outer.fire_sync(CancelReason::Condition, &combined);
        }
    }

    fn set_deadline(&self, _deadline: tokio::time::Instant) {
        // A deadline child of an all-of gate is not the operation's
        // deadline; elapsing it only records an arrival.
    }

    fn report_error(&self, error: SourceError) {
        self.outer.report_error(error);
    }
}

#[async_trait]
impl CancelSource for AllOfSource {
    fn description(&self) -> String {
        let children: Vec<String> = self.children.iter().map(|c| c.description()).collect();
        format!("all of [{}]", children.join(", "))
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Composite
    }

    fn triggered(&self) -> bool {
        self.shared.fired.load(Ordering::Acquire)
    }

    async fn activate(&mut self, handle: FireHandle) -> Result<(), ActivationError> {
        self.slot.arm(&self.description())?;

        for index in 0..self.children.len() {
            let target = AllOfChildTarget {
                outer: handle.clone(),
                shared: Arc::clone(&self.shared),
                index,
            };
            if let Err(err) = self.children[index]
                .activate(FireHandle::new(Arc::new(target)))
                .await
            {
                for started in self.children.iter_mut().take(index).rev() {
                    started.deactivate().await;
                }
                self.slot.disarm();
                return Err(err);
            }
        }

        debug!(
            operation_id = %handle.operation_id(),
            children = self.children.len(),
            "all-of source activated"
        );
        Ok(())
    }

    async fn deactivate(&mut self) {
        if !self.slot.disarm() {
            return;
        }
        for child in self.children.iter_mut().rev() {
            child.deactivate().await;
        }
        debug!(
            arrived = self.arrived(),
            fired = self.triggered(),
            "all-of source deactivated"
        );
    }
}
