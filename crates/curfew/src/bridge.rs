//! Bridging between plain OS threads and the tokio runtime.
//!
//! Two directions:
//!
//! - [`call_soon_threadsafe`] lets a non-async thread enqueue work onto a
//!   runtime. [`CancelToken::cancel_sync`](crate::CancelToken::cancel_sync)
//!   uses the same mechanism internally to marshal callback execution.
//! - [`run_in_thread`] lets async code offload blocking work to the
//!   runtime's blocking pool and await the result, remaining cancellable at
//!   the await point.

use thiserror::Error;
use tokio::runtime::Handle;

/// The bridged call could not produce a result.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The offloaded closure panicked.
    #[error("bridged task panicked")]
    Panicked,

    /// The runtime shut down before the closure ran to completion.
    #[error("runtime shut down before the bridged task completed")]
    RuntimeGone,
}

/// Enqueue `f` to run on the runtime behind `handle`.
///
/// Callable from any thread; never blocks. The closure runs on the runtime's
/// executor at the next opportunity. There is no completion signal — use
/// [`run_in_thread`] from async code when a result is needed.
///
/// ```rust,no_run
/// use curfew::call_soon_threadsafe;
/// use tokio::runtime::Handle;
///
/// fn from_some_thread(handle: Handle) {
///     call_soon_threadsafe(&handle, || {
///         tracing::info!("running on the runtime");
///     });
/// }
/// ```
pub fn call_soon_threadsafe<F>(handle: &Handle, f: F)
where
    F: FnOnce() + Send + 'static,
{
    handle.spawn(async move { f() });
}

/// Offload blocking work to the runtime's worker-thread pool and await it.
///
/// The await point is cancellable: if the caller is dropped (for example
/// because its enclosing operation was cancelled), the result is discarded.
/// The closure itself keeps running to completion on its worker thread —
/// cooperative cancellation cannot preempt compute-bound work, so long
/// closures should check a [`CancelToken`](crate::CancelToken) themselves.
pub async fn run_in_thread<F, T>(f: F) -> Result<T, BridgeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        if e.is_panic() {
            BridgeError::Panicked
        } else {
            BridgeError::RuntimeGone
        }
    })
}
