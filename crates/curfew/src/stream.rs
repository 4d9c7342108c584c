//! Cancellation-aware stream wrapping.
//!
//! [`CancelStream`] pulls from any [`futures::Stream`] with a cancellation
//! check before each element; [`ChunkStream`] amortizes the check over
//! chunks of up to K elements for cheap per-item work. Both optionally
//! record partial output on the operation, so a cancelled consumer can
//! retrieve what was produced before the cut.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::CancelledError;
use crate::operation::Operation;
use crate::state::{Metadata, PartialResult, PartialSummary};

/// Cap on buffered partial elements; older elements are dropped first.
const BUFFER_CAP: usize = 1000;

type Recorder<T> = Box<dyn FnMut(&T) + Send>;
type Finalizer = Box<dyn Fn(&Operation, usize, bool) + Send>;

/// A stream wrapped with per-element cancellation checks.
///
/// Yields `Result` elements: `Ok` items in source order, or a single `Err`
/// carrying the cancellation, after which the stream is exhausted.
///
/// ```rust,no_run
/// use curfew::Operation;
/// use futures::stream;
///
/// # async fn example() -> Result<(), curfew::CancelledError> {
/// let op = Operation::new();
/// let mut items = op.stream(stream::iter(0..100)).buffer_partial();
///
/// while let Some(item) = items.next().await {
///     let item = item?; // Err means the operation was cancelled
///     let _ = item;
/// }
/// # Ok(())
/// # }
/// ```
pub struct CancelStream<S: Stream> {
    op: Operation,
    inner: Pin<Box<S>>,
    count: usize,
    report_interval: Option<usize>,
    recorder: Option<Recorder<S::Item>>,
    finalize: Finalizer,
    done: bool,
    finalized: bool,
}

impl<S: Stream> CancelStream<S> {
    pub(crate) fn new(op: Operation, stream: S) -> Self {
        Self {
            op,
            inner: Box::pin(stream),
            count: 0,
            report_interval: None,
            recorder: None,
            finalize: Box::new(|op, count, completed| {
                op.store_partial(PartialResult {
                    summary: PartialSummary { count, completed },
                    items: None,
                });
            }),
            done: false,
            finalized: false,
        }
    }

    /// Emit a progress report every `n` elements (must be positive).
    ///
    /// Reports carry a `count` metadata entry with the running total.
    pub fn report_every(mut self, n: usize) -> Self {
        self.report_interval = Some(n.max(1));
        self
    }

    /// Buffer yielded elements into the operation's partial result.
    ///
    /// At most the last [`BUFFER_CAP`](self) elements are kept. After
    /// cancellation (or completion), retrieve them with
    /// [`Operation::partial_items`].
    pub fn buffer_partial(mut self) -> Self
    where
        S::Item: Clone + Send + Sync + 'static,
    {
        let items: Arc<Mutex<Vec<S::Item>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&items);
        self.recorder = Some(Box::new(move |item| {
            let mut buffer = sink.lock();
            buffer.push(item.clone());
            if buffer.len() > BUFFER_CAP {
                let overflow = buffer.len() - BUFFER_CAP;
                buffer.drain(..overflow);
            }
        }));

        self.finalize = Box::new(move |op, count, completed| {
            op.store_partial(PartialResult {
                summary: PartialSummary { count, completed },
                items: Some(Box::new(items.lock().clone())),
            });
        });
        self
    }

    /// Elements yielded so far.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Pull the next element, checking for cancellation first.
    ///
    /// Returns `Some(Err(..))` exactly once when the operation's token has
    /// fired, then `None`. Elements are never reordered.
    pub async fn next(&mut self) -> Option<Result<S::Item, CancelledError>> {
        if self.done {
            return None;
        }

        if let Err(cancelled) = self.op.token().check_async().await {
            self.finish(false);
            return Some(Err(cancelled));
        }

        match self.inner.next().await {
            Some(item) => {
                self.count += 1;
                if let Some(recorder) = &mut self.recorder {
                    recorder(&item);
                }
                if let Some(interval) = self.report_interval {
                    if self.count % interval == 0 {
                        let mut metadata = Metadata::new();
                        metadata.insert("count".to_owned(), self.count.into());
                        // A cancellation here is not lost: the element in
                        // hand is still yielded, and the next pull observes
                        // the token.
                        let _ = self
                            .op
                            .report_progress(
                                &format!("processed {} items", self.count),
                                Some(metadata),
                            )
                            .await;
                    }
                }
                Some(Ok(item))
            }
            None => {
                self.finish(true);
                None
            }
        }
    }

    fn finish(&mut self, completed: bool) {
        self.done = true;
        if !self.finalized {
            self.finalized = true;
            (self.finalize)(&self.op, self.count, completed);
            debug!(
                operation_id = %self.op.id(),
                count = self.count,
                completed,
                "stream finished"
            );
        }
    }
}

impl<S: Stream> Drop for CancelStream<S> {
    fn drop(&mut self) {
        // A consumer that walks away mid-stream still leaves its partial
        // output behind.
        if !self.finalized {
            self.finalized = true;
            (self.finalize)(&self.op, self.count, false);
        }
    }
}

/// A stream wrapped with per-chunk cancellation checks.
///
/// Yields `Vec`s of up to K elements; the cancellation check runs between
/// chunks rather than between elements, which is the right trade when
/// per-element cost is small.
pub struct ChunkStream<S: Stream> {
    op: Operation,
    inner: Pin<Box<S>>,
    chunk_size: usize,
    count: usize,
    done: bool,
}

impl<S: Stream> ChunkStream<S> {
    pub(crate) fn new(op: Operation, stream: S, chunk_size: usize) -> Self {
        Self {
            op,
            inner: Box::pin(stream),
            chunk_size: chunk_size.max(1),
            count: 0,
            done: false,
        }
    }

    /// Elements yielded so far, across all chunks.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Pull the next chunk, checking for cancellation first.
    pub async fn next_chunk(&mut self) -> Option<Result<Vec<S::Item>, CancelledError>> {
        if self.done {
            return None;
        }

        if let Err(cancelled) = self.op.token().check_async().await {
            self.done = true;
            return Some(Err(cancelled));
        }

        let mut chunk = Vec::with_capacity(self.chunk_size);
        while chunk.len() < self.chunk_size {
            match self.inner.next().await {
                Some(item) => chunk.push(item),
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if chunk.is_empty() {
            None
        } else {
            self.count += chunk.len();
            Some(Ok(chunk))
        }
    }
}

impl Operation {
    /// Wrap a stream with per-element cancellation checks.
    ///
    /// See [`CancelStream`] for reporting and partial-result options.
    pub fn stream<S: Stream>(&self, stream: S) -> CancelStream<S> {
        CancelStream::new(self.clone(), stream)
    }

    /// Wrap a stream with per-chunk cancellation checks.
    pub fn chunks<S: Stream>(&self, stream: S, chunk_size: usize) -> ChunkStream<S> {
        ChunkStream::new(self.clone(), stream, chunk_size)
    }
}
