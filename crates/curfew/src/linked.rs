//! Tokens wired to fire when any of several parent tokens fire.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::reason::CancelReason;
use crate::token::{CancelInfo, CancelToken};

/// How a linked token translates a parent's cancellation into its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Fire with the parent's own reason and message.
    ///
    /// Used when combining peer scopes: whichever input fired first is the
    /// cause, and its reason should win.
    Preserve,

    /// Fire with [`CancelReason::Parent`].
    ///
    /// Used for true parent→child hierarchy, where the child's cause is
    /// "my parent was cancelled" regardless of why the parent was.
    AsParent,
}

/// A [`CancelToken`] that fires when any linked parent token fires.
///
/// The link is one-way: cancelling this token does not touch its parents.
/// The first parent to fire wins and is recorded as the
/// [`origin`](Self::origin); the linked token's one-shot semantics make every
/// later parent a no-op.
///
/// Parents hold a callback that references this token weakly, so a linked
/// token dropped before its parents fires nothing and leaks nothing; and a
/// token's callback list is cleared when it fires, so no reference cycles
/// survive cancellation.
///
/// # Example
///
/// ```rust,no_run
/// use curfew::{CancelReason, CancelToken, LinkMode, LinkedToken};
///
/// # async fn example() {
/// let a = CancelToken::new();
/// let b = CancelToken::new();
///
/// let linked = LinkedToken::new();
/// linked.link(&a, LinkMode::Preserve).await;
/// linked.link(&b, LinkMode::Preserve).await;
///
/// a.cancel(CancelReason::Timeout, Some("deadline")).await;
///
/// assert!(linked.is_cancelled());
/// assert_eq!(linked.reason(), Some(CancelReason::Timeout));
/// assert_eq!(linked.origin(), Some(a.id().to_owned()));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LinkedToken {
    token: CancelToken,
    origin: Arc<Mutex<Option<String>>>,
    parents: Arc<Mutex<Vec<String>>>,
}

impl LinkedToken {
    /// Create a new linked token with no parents yet.
    pub fn new() -> Self {
        Self::from_token(CancelToken::new())
    }

    /// Wrap an existing token so parents can be linked onto it.
    ///
    /// The wrapped token shares state with `token`: cancellation is visible
    /// through both handles.
    pub fn from_token(token: CancelToken) -> Self {
        Self {
            token,
            origin: Arc::new(Mutex::new(None)),
            parents: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The underlying token.
    #[inline]
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Id of the parent token whose firing cancelled this one, if any.
    pub fn origin(&self) -> Option<String> {
        self.origin.lock().clone()
    }

    /// Ids of all linked parent tokens.
    pub fn parent_ids(&self) -> Vec<String> {
        self.parents.lock().clone()
    }

    /// Link a parent token: when `parent` fires, this token fires too.
    ///
    /// If `parent` has already fired, this token is cancelled before the
    /// method returns. Linking after this token has itself fired is harmless.
    pub async fn link(&self, parent: &CancelToken, mode: LinkMode) {
        let weak = self.token.downgrade();
        let origin = Arc::clone(&self.origin);
        let parent_id = parent.id().to_owned();

        debug!(
            token_id = %self.token.id(),
            parent_id = %parent_id,
            mode = ?mode,
            "linking cancellation tokens"
        );

        let callback_parent_id = parent_id.clone();
        parent
            .register_async_callback(move |info: CancelInfo| {
                let weak = weak.clone();
                let origin = Arc::clone(&origin);
                let parent_id = callback_parent_id.clone();
                async move {
                    let Some(child) = weak.upgrade() else { return };
                    let (reason, message) = translate(mode, &parent_id, &info);
                    if child.cancel(reason, Some(&message)).await {
                        let mut slot = origin.lock();
                        if slot.is_none() {
                            *slot = Some(parent_id);
                        }
                    }
                }
            })
            .await;

        self.parents.lock().push(parent_id);
    }
}

fn translate(mode: LinkMode, parent_id: &str, info: &CancelInfo) -> (CancelReason, String) {
    let note = format!("linked token {} cancelled", short_id(parent_id));
    match mode {
        LinkMode::Preserve => {
            let message = match &info.message {
                Some(m) => format!("{m} ({note})"),
                None => note,
            };
            (info.reason, message)
        }
        LinkMode::AsParent => (CancelReason::Parent, note),
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

impl Default for LinkedToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for LinkedToken {
    type Target = CancelToken;

    fn deref(&self) -> &CancelToken {
        &self.token
    }
}
