//! Process-wide directory of live and recently finished operations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::UsageError;
use crate::glob::glob_match;
use crate::operation::Operation;
use crate::reason::CancelReason;
use crate::state::{OperationSnapshot, OperationStatus};

const DEFAULT_HISTORY_CAP: usize = 1000;

/// Filter for [`Registry::list`] and [`Registry::cancel_all`].
///
/// All fields are optional and combined with AND. Name patterns are
/// shell-style globs (`*`, `?`, `[...]`) matched against the operation's
/// name; an unnamed operation only matches the pattern `*`.
///
/// ```rust
/// use curfew::{OperationFilter, OperationStatus};
/// use std::time::Duration;
///
/// let filter = OperationFilter::new()
///     .status(OperationStatus::Running)
///     .name("fetch-*")
///     .older_than(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    status: Option<OperationStatus>,
    parent_id: Option<String>,
    name_glob: Option<String>,
    min_age: Option<Duration>,
    max_age: Option<Duration>,
}

impl OperationFilter {
    /// An empty filter matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match only operations with this status.
    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Match only direct children of this operation.
    pub fn parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Match operation names against a shell-style glob.
    pub fn name(mut self, pattern: impl Into<String>) -> Self {
        self.name_glob = Some(pattern.into());
        self
    }

    /// Match only operations at least this old.
    pub fn older_than(mut self, age: Duration) -> Self {
        self.min_age = Some(age);
        self
    }

    /// Match only operations at most this old.
    pub fn younger_than(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    fn matches(&self, snapshot: &OperationSnapshot) -> bool {
        if let Some(status) = self.status {
            if snapshot.status != status {
                return false;
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if snapshot.parent_id.as_deref() != Some(parent_id.as_str()) {
                return false;
            }
        }
        if let Some(pattern) = &self.name_glob {
            if !glob_match(pattern, snapshot.name.as_deref().unwrap_or("")) {
                return false;
            }
        }
        let age = snapshot.age();
        if let Some(min_age) = self.min_age {
            if age < min_age {
                return false;
            }
        }
        if let Some(max_age) = self.max_age {
            if age > max_age {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts over a registry.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of live operations.
    pub active: usize,
    /// Live operations bucketed by status label.
    pub active_by_status: HashMap<&'static str, usize>,
    /// Number of retained historical operations.
    pub history: usize,
    /// Historical operations bucketed by final status label.
    pub history_by_status: HashMap<&'static str, usize>,
    /// Completed operations contributing to the average duration.
    pub total_completed: usize,
    /// Mean wall time of completed operations, if any completed.
    pub average_duration: Option<Duration>,
}

struct RegistryState {
    active: HashMap<String, Operation>,
    history: VecDeque<OperationSnapshot>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    history_cap: usize,
}

/// Tracks live operations for introspection and bulk control, and retains a
/// bounded ring of finished ones for historical queries.
///
/// Operations register themselves on entry and move to history on exit.
/// Most callers use the lazily created process-wide instance via
/// [`Registry::global`]; tests wanting isolation construct their own with
/// [`Registry::new`] and route operations to it with
/// [`OperationBuilder::registry`](crate::OperationBuilder::registry).
///
/// All mutation happens under an internal lock with bounded critical
/// sections; returned snapshots are independent copies.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    /// A fresh registry with the default history cap (1000 entries).
    pub fn new() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }

    /// A fresh registry retaining at most `cap` historical entries.
    pub fn with_history_cap(cap: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState {
                    active: HashMap::new(),
                    history: VecDeque::new(),
                }),
                history_cap: cap,
            }),
        }
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(|| {
            info!("global operation registry initialized");
            Registry::new()
        })
    }

    pub(crate) fn register(&self, operation: Operation) -> Result<(), UsageError> {
        let mut state = self.inner.state.lock();
        let id = operation.id().to_owned();
        if state.active.contains_key(&id) {
            return Err(UsageError::DuplicateId(id));
        }
        debug!(
            operation_id = %id,
            name = operation.name(),
            total = state.active.len() + 1,
            "operation registered"
        );
        state.active.insert(id, operation);
        Ok(())
    }

    /// Move `id` from the active map to history. Unknown ids are a no-op.
    pub(crate) fn unregister(&self, id: &str) {
        let mut state = self.inner.state.lock();
        let Some(operation) = state.active.remove(id) else {
            return;
        };
        let snapshot = operation.snapshot();
        debug!(
            operation_id = %id,
            final_status = %snapshot.status,
            "operation unregistered"
        );
        state.history.push_back(snapshot);
        let cap = self.inner.history_cap;
        while state.history.len() > cap {
            state.history.pop_front();
        }
    }

    /// Remove `id` without recording history (entry-failure rollback).
    pub(crate) fn discard(&self, id: &str) {
        self.inner.state.lock().active.remove(id);
    }

    /// Snapshot of an operation by id, live or historical.
    pub fn get(&self, id: &str) -> Option<OperationSnapshot> {
        let state = self.inner.state.lock();
        if let Some(operation) = state.active.get(id) {
            return Some(operation.snapshot());
        }
        state.history.iter().rev().find(|s| s.id == id).cloned()
    }

    /// The live operation handle for `id`, if it is still active.
    pub fn get_live(&self, id: &str) -> Option<Operation> {
        self.inner.state.lock().active.get(id).cloned()
    }

    /// Number of live operations.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Snapshots of live operations matching `filter`.
    pub fn list(&self, filter: &OperationFilter) -> Vec<OperationSnapshot> {
        self.inner
            .state
            .lock()
            .active
            .values()
            .map(Operation::snapshot)
            .filter(|s| filter.matches(s))
            .collect()
    }

    /// Snapshots of the live direct children of `parent_id`.
    pub fn get_children(&self, parent_id: &str) -> Vec<OperationSnapshot> {
        self.list(&OperationFilter::new().parent(parent_id))
    }

    /// Cancel a live operation by id. Returns whether it was found.
    pub async fn cancel_operation(
        &self,
        id: &str,
        reason: CancelReason,
        message: Option<&str>,
    ) -> bool {
        let Some(operation) = self.get_live(id) else {
            warn!(operation_id = %id, "cancel requested for unknown operation");
            return false;
        };
        operation.cancel_with(reason, message, true).await;
        true
    }

    /// Thread-safe variant of [`cancel_operation`](Self::cancel_operation).
    pub fn cancel_operation_sync(
        &self,
        id: &str,
        reason: CancelReason,
        message: Option<&str>,
    ) -> bool {
        let Some(operation) = self.get_live(id) else {
            return false;
        };
        operation.cancel_sync(reason, message);
        true
    }

    /// Cancel every live operation matching `filter`. Returns the count.
    ///
    /// The active set is snapshotted under the lock; cancellation happens
    /// outside it.
    pub async fn cancel_all(
        &self,
        filter: &OperationFilter,
        reason: CancelReason,
        message: Option<&str>,
    ) -> usize {
        let matching: Vec<Operation> = {
            self.inner
                .state
                .lock()
                .active
                .values()
                .filter(|op| filter.matches(&op.snapshot()))
                .cloned()
                .collect()
        };
        let message = message.unwrap_or("bulk cancellation");
        for operation in &matching {
            operation.cancel_with(reason, Some(message), true).await;
        }
        info!(cancelled = matching.len(), "bulk cancellation completed");
        matching.len()
    }

    /// Thread-safe variant of [`cancel_all`](Self::cancel_all).
    pub fn cancel_all_sync(
        &self,
        filter: &OperationFilter,
        reason: CancelReason,
        message: Option<&str>,
    ) -> usize {
        let matching: Vec<Operation> = {
            self.inner
                .state
                .lock()
                .active
                .values()
                .filter(|op| filter.matches(&op.snapshot()))
                .cloned()
                .collect()
        };
        let message = message.unwrap_or("bulk cancellation");
        for operation in &matching {
            operation.cancel_sync(reason, Some(message));
        }
        matching.len()
    }

    /// Historical snapshots, newest last.
    ///
    /// `status` filters on final status; `since` keeps only operations that
    /// ended at or after the given instant; `limit` keeps the newest N.
    pub fn history(
        &self,
        limit: Option<usize>,
        status: Option<OperationStatus>,
        since: Option<Instant>,
    ) -> Vec<OperationSnapshot> {
        let state = self.inner.state.lock();
        let mut entries: Vec<OperationSnapshot> = state
            .history
            .iter()
            .filter(|s| status.map_or(true, |want| s.status == want))
            .filter(|s| match since {
                Some(since) => s.ended_at.is_some_and(|ended| ended >= since),
                None => true,
            })
            .cloned()
            .collect();
        if let Some(limit) = limit {
            let start = entries.len().saturating_sub(limit);
            entries.drain(..start);
        }
        entries
    }

    /// Trim history: drop entries older than `max_age`, or everything when
    /// `None`. Returns how many were dropped.
    pub fn cleanup_completed(&self, max_age: Option<Duration>) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.history.len();
        match max_age {
            None => state.history.clear(),
            Some(max_age) => {
                state
                    .history
                    .retain(|s| s.ended_at.is_some_and(|ended| ended.elapsed() <= max_age));
            }
        }
        let dropped = before - state.history.len();
        if dropped > 0 {
            debug!(dropped, "history trimmed");
        }
        dropped
    }

    /// Drop all live entries and history without cancelling anything.
    ///
    /// For tests only: live operations keep running but become invisible.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.active.clear();
        state.history.clear();
        warn!("registry cleared");
    }

    /// Aggregate counts over live and historical operations.
    pub fn stats(&self) -> RegistryStats {
        let state = self.inner.state.lock();

        let mut active_by_status: HashMap<&'static str, usize> = HashMap::new();
        for operation in state.active.values() {
            *active_by_status
                .entry(operation.status().as_str())
                .or_default() += 1;
        }

        let mut history_by_status: HashMap<&'static str, usize> = HashMap::new();
        let mut total_completed = 0usize;
        let mut completed_duration = Duration::ZERO;
        for snapshot in &state.history {
            *history_by_status.entry(snapshot.status.as_str()).or_default() += 1;
            if snapshot.status == OperationStatus::Completed {
                if let Some(duration) = snapshot.duration() {
                    total_completed += 1;
                    completed_duration += duration;
                }
            }
        }

        RegistryStats {
            active: state.active.len(),
            active_by_status,
            history: state.history.len(),
            history_by_status,
            total_completed,
            average_duration: (total_completed > 0)
                .then(|| completed_duration / total_completed as u32),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Registry")
            .field("active", &state.active.len())
            .field("history", &state.history.len())
            .finish()
    }
}
