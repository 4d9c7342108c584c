//! The thread-safe one-shot cancellation token.
//!
//! [`CancelToken`] is the primitive every other part of the crate signals
//! through. It is an `Arc`-backed handle with unified clone semantics: clone
//! to share, any clone can cancel, any clone can observe.
//!
//! # Example
//!
//! ```rust,no_run
//! use curfew::{CancelReason, CancelToken};
//!
//! # async fn example() {
//! let token = CancelToken::new();
//! let waiter = token.clone();
//!
//! tokio::spawn(async move {
//!     waiter.wait().await;
//!     println!("cancelled: {:?}", waiter.reason());
//! });
//!
//! token.cancel(CancelReason::Manual, Some("shutting down")).await;
//! # }
//! ```
//!
//! # One-shot semantics
//!
//! A token fires at most once. The first `cancel` wins: it records the reason
//! and message, wakes all waiters, and drains the callback list. Every later
//! `cancel` is an idempotent no-op returning `false`.
//!
//! # Thread safety
//!
//! [`cancel_sync`](CancelToken::cancel_sync) may be called from any OS
//! thread. Waking waiters is runtime-agnostic; running the registered
//! callbacks is marshalled onto the runtime the token is bound to (the first
//! runtime that observed it). A `cancel_sync` before any runtime observation
//! performs only the flag update and wakeup; pending callbacks fire once a
//! runtime first observes the token.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::CancelledError;
use crate::reason::CancelReason;

/// What a callback learns when a token fires.
#[derive(Debug, Clone)]
pub struct CancelInfo {
    /// Why the token was cancelled.
    pub reason: CancelReason,
    /// Optional human-readable message recorded at cancellation.
    pub message: Option<String>,
    /// When the token fired (monotonic).
    pub cancelled_at: Instant,
    /// Id of the token that fired.
    pub token_id: String,
}

pub(crate) enum Callback {
    Sync(Box<dyn Fn(&CancelInfo) + Send + Sync>),
    Async(Box<dyn Fn(CancelInfo) -> BoxFuture<'static, ()> + Send + Sync>),
}

type CallbackList = SmallVec<[Callback; 2]>;

struct TokenState {
    reason: Option<CancelReason>,
    message: Option<String>,
    cancelled_at: Option<Instant>,
    callbacks: CallbackList,
    runtime: Option<Handle>,
}

struct TokenInner {
    id: String,
    cancelled: AtomicBool,
    state: Mutex<TokenState>,
    notify: Notify,
}

/// A thread-safe one-shot cancellation signal.
///
/// See the [module docs](self) for semantics. Cheap to clone; all clones
/// share the same state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        debug!(token_id = %id, "created cancellation token");
        Self {
            inner: Arc::new(TokenInner {
                id,
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TokenState {
                    reason: None,
                    message: None,
                    cancelled_at: None,
                    callbacks: SmallVec::new(),
                    runtime: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a token that is already cancelled.
    ///
    /// Useful for tests and for signalling immediate cancellation.
    pub fn already_cancelled(reason: CancelReason, message: Option<&str>) -> Self {
        let token = Self::new();
        // Token is private to this call; sync path cannot race anything.
        let _ = token.fire(reason, message);
        token
    }

    /// This token's unique id.
    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns `true` if the token has fired.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The recorded reason, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.state.lock().reason
    }

    /// The recorded message, once cancelled.
    pub fn message(&self) -> Option<String> {
        self.inner.state.lock().message.clone()
    }

    /// When the token fired, once cancelled.
    pub fn cancelled_at(&self) -> Option<Instant> {
        self.inner.state.lock().cancelled_at
    }

    /// Cancel the token.
    ///
    /// On the first call: records `reason` and `message`, wakes every
    /// [`wait()`](Self::wait)er, then invokes registered callbacks in
    /// registration order (sync callbacks called directly, async callbacks
    /// awaited sequentially). Idempotent: returns `false` if the token had
    /// already fired.
    pub async fn cancel(&self, reason: CancelReason, message: Option<&str>) -> bool {
        self.bind_runtime();
        let Some((info, callbacks)) = self.fire(reason, message) else {
            debug!(token_id = %self.inner.id, "token already cancelled");
            return false;
        };
        run_callbacks(info, callbacks).await;
        true
    }

    /// Cancel the token from any thread.
    ///
    /// Performs the same atomic transition as [`cancel`](Self::cancel) and
    /// wakes waiters immediately. Callbacks are marshalled onto the runtime
    /// this token is bound to. Returns `false` if the token had already
    /// fired, or if no runtime is bound yet — in the latter case the flag is
    /// still set and waiters are still woken; pending callbacks run when a
    /// runtime first observes the token.
    pub fn cancel_sync(&self, reason: CancelReason, message: Option<&str>) -> bool {
        let runtime = self.inner.state.lock().runtime.clone();
        let Some((info, callbacks)) = self.fire(reason, message) else {
            return false;
        };
        match runtime {
            Some(handle) => {
                handle.spawn(run_callbacks(info, callbacks));
                true
            }
            None => {
                // Flag-only cancellation: park the callbacks until a runtime
                // observes this token.
                self.inner.state.lock().callbacks = callbacks;
                debug!(
                    token_id = %self.inner.id,
                    "cancel_sync before runtime binding; callbacks deferred"
                );
                false
            }
        }
    }

    /// Synchronous cancellation check.
    ///
    /// Returns `Err` carrying the recorded reason and message if the token
    /// has fired.
    ///
    /// ```rust
    /// use curfew::{CancelReason, CancelToken};
    ///
    /// let token = CancelToken::already_cancelled(CancelReason::Manual, Some("stop"));
    /// let err = token.check().unwrap_err();
    /// assert_eq!(err.reason(), CancelReason::Manual);
    /// ```
    pub fn check(&self) -> Result<(), CancelledError> {
        if !self.is_cancelled() {
            return Ok(());
        }
        let state = self.inner.state.lock();
        Err(CancelledError::new(
            state.reason.unwrap_or(CancelReason::Manual),
            state.message.as_deref(),
        ))
    }

    /// Async cancellation check.
    ///
    /// Behaves like [`check`](Self::check) but also binds the token to the
    /// current runtime, so this is a valid first observation point for
    /// cross-thread cancellation.
    pub async fn check_async(&self) -> Result<(), CancelledError> {
        self.bind_runtime();
        self.check()
    }

    /// Wait until the token fires.
    ///
    /// Resolves immediately if the token is already cancelled. A cancellation
    /// performed from another thread before any async observer existed is
    /// still observed here.
    pub async fn wait(&self) {
        self.bind_runtime();
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a wakeup between the
        // check and the await is not lost.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Register a synchronous callback fired on cancellation.
    ///
    /// If the token has already fired, the callback is invoked immediately
    /// with the recorded reason and message.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&CancelInfo) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        if self.is_cancelled() {
            let info = info_from_state(&self.inner.id, &state);
            drop(state);
            callback(&info);
        } else {
            state.callbacks.push(Callback::Sync(Box::new(callback)));
        }
    }

    /// Register an async callback fired on cancellation.
    ///
    /// Async callbacks are awaited sequentially, in registration order, after
    /// all earlier callbacks. If the token has already fired, the callback is
    /// awaited before this method returns.
    pub async fn register_async_callback<F, Fut>(&self, callback: F)
    where
        F: Fn(CancelInfo) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback = Arc::new(callback);
        let immediate = {
            let mut state = self.inner.state.lock();
            if self.is_cancelled() {
                Some(info_from_state(&self.inner.id, &state))
            } else {
                let callback = Arc::clone(&callback);
                state
                    .callbacks
                    .push(Callback::Async(Box::new(move |info| Box::pin(callback(info)))));
                None
            }
        };
        if let Some(info) = immediate {
            callback(info).await;
        }
    }

    /// Bind this token to the current tokio runtime, if not bound yet.
    ///
    /// Called on every async observation. If a pre-binding `cancel_sync`
    /// deferred callbacks, they are spawned onto the freshly bound runtime
    /// here.
    pub(crate) fn bind_runtime(&self) {
        let deferred = {
            let mut state = self.inner.state.lock();
            if state.runtime.is_none() {
                if let Ok(handle) = Handle::try_current() {
                    state.runtime = Some(handle);
                }
            }
            if state.runtime.is_some()
                && self.is_cancelled()
                && !state.callbacks.is_empty()
            {
                let callbacks = std::mem::take(&mut state.callbacks);
                let info = info_from_state(&self.inner.id, &state);
                state.runtime.clone().map(|handle| (handle, info, callbacks))
            } else {
                None
            }
        };
        if let Some((handle, info, callbacks)) = deferred {
            handle.spawn(run_callbacks(info, callbacks));
        }
    }

    /// First half of a cancellation: the atomic state transition.
    ///
    /// Returns the cancellation info and the drained callback list on the
    /// winning call, `None` on every later call. Waking waiters happens here
    /// too; invoking callbacks is the caller's job, outside the lock.
    fn fire(&self, reason: CancelReason, message: Option<&str>) -> Option<(CancelInfo, CallbackList)> {
        let (info, callbacks) = {
            let mut state = self.inner.state.lock();
            if self.inner.cancelled.load(Ordering::Acquire) {
                return None;
            }
            let at = Instant::now();
            state.reason = Some(reason);
            state.message = message.map(str::to_owned);
            state.cancelled_at = Some(at);
            self.inner.cancelled.store(true, Ordering::Release);
            let callbacks = std::mem::take(&mut state.callbacks);
            (
                CancelInfo {
                    reason,
                    message: state.message.clone(),
                    cancelled_at: at,
                    token_id: self.inner.id.clone(),
                },
                callbacks,
            )
        };
        self.inner.notify.notify_waiters();
        info!(
            token_id = %self.inner.id,
            reason = reason.as_str(),
            detail = info.message.as_deref(),
            "token cancelled"
        );
        Some((info, callbacks))
    }
}

/// A weak handle to a token, used by linked tokens so a parent's callback
/// does not keep the child alive.
#[derive(Clone)]
pub(crate) struct WeakCancelToken {
    inner: std::sync::Weak<TokenInner>,
}

impl WeakCancelToken {
    pub(crate) fn upgrade(&self) -> Option<CancelToken> {
        self.inner.upgrade().map(|inner| CancelToken { inner })
    }
}

impl CancelToken {
    pub(crate) fn downgrade(&self) -> WeakCancelToken {
        WeakCancelToken {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

async fn run_callbacks(info: CancelInfo, callbacks: CallbackList) {
    for callback in callbacks {
        match callback {
            Callback::Sync(f) => f(&info),
            Callback::Async(f) => f(info.clone()).await,
        }
    }
}

fn info_from_state(id: &str, state: &TokenState) -> CancelInfo {
    CancelInfo {
        reason: state.reason.unwrap_or(CancelReason::Manual),
        message: state.message.clone(),
        cancelled_at: state.cancelled_at.unwrap_or_else(Instant::now),
        token_id: id.to_owned(),
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for CancelToken {}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
