//! Collaborator contracts and stream capabilities.
//!
//! [`Source`] and [`Sink`] are implemented by the code that produces or
//! consumes chunks. The engine drives them: it decides when a source is asked
//! for more data and when a sink is handed the next chunk.
//!
//! [`Readable`] and [`Writable`] are the capabilities the connector relies on.
//! They are kept separate so one type can offer both without either being a
//! special case of the other.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::chunk::Chunk;
use crate::emitter::{Listener, ListenerId};
use crate::error::{Error, Result};
use crate::sink::{SinkEvent, SinkEventKind, SinkState};
use crate::source::{SourceController, SourceEvent, SourceEventKind, SourceState};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub(crate) fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The production contract of a source stream.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use flowpipe::error::Result;
/// use flowpipe::source::SourceController;
/// use flowpipe::traits::Source;
///
/// struct Counter {
///     current: u64,
///     max: u64,
/// }
///
/// #[async_trait]
/// impl Source for Counter {
///     type Item = u64;
///
///     async fn refill(&mut self, ctl: &mut SourceController<u64>) -> Result<()> {
///         while self.current <= self.max {
///             let item = self.current;
///             self.current += 1;
///             if !ctl.push(item) {
///                 return Ok(()); // over the high water mark
///             }
///         }
///         ctl.end();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Source: Send + 'static {
    /// The type of chunks this source produces
    type Item: Chunk;

    /// Produce more data.
    ///
    /// Called by the engine whenever the stream's queue has room and the
    /// stream has not ended, never concurrently with itself. Before returning
    /// it must push at least one chunk or signal end-of-data through `ctl`;
    /// returning `Ok(())` having done neither fails the stream with
    /// [`Error::Production`](crate::error::Error::Production).
    /// Keep pushing while [`SourceController::push`] returns `true`; once it
    /// returns `false` the engine waits for the queue to drain before calling
    /// again.
    async fn refill(&mut self, ctl: &mut SourceController<Self::Item>) -> Result<()>;
}

/// The consumption contract of a sink stream.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use flowpipe::error::Result;
/// use flowpipe::traits::Sink;
///
/// struct LineCounter(usize);
///
/// #[async_trait]
/// impl Sink for LineCounter {
///     type Item = String;
///
///     async fn write(&mut self, item: String) -> Result<()> {
///         self.0 += item.lines().count();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + 'static {
    /// The type of chunks this sink accepts
    type Item: Chunk;

    /// Process exactly one chunk.
    ///
    /// The engine hands over chunks in write order and does not call this
    /// again until the returned future has resolved. Resolving with `Err`
    /// moves the stream to its errored state.
    async fn write(&mut self, item: Self::Item) -> Result<()>;

    /// Called once after the last chunk of an ended stream was processed.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The producer side of a stream, as seen by a connector.
pub trait Readable: Clone + Send + Sync + 'static {
    type Chunk: Chunk;

    fn id(&self) -> StreamId;

    fn state(&self) -> SourceState;

    /// The error that terminated the stream, if any
    fn error(&self) -> Option<Error>;

    fn read(&self) -> Option<Self::Chunk>;

    /// Put a chunk back at the head of the queue
    fn unshift(&self, chunk: Self::Chunk);

    fn pause(&self);

    fn resume(&self);

    fn is_paused(&self) -> bool;

    fn destroy(&self, error: Option<Error>);

    /// Register a listener. Subscribing to
    /// [`SourceEventKind::Data`] switches the stream to flowing mode.
    fn subscribe(
        &self,
        kind: SourceEventKind,
        listener: Listener<SourceEvent<Self::Chunk>>,
    ) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;
}

/// The consumer side of a stream, as seen by a connector.
pub trait Writable: Clone + Send + Sync + 'static {
    type Chunk: Chunk;

    fn id(&self) -> StreamId;

    fn state(&self) -> SinkState;

    fn error(&self) -> Option<Error>;

    /// Queue a chunk; `Ok(false)` asks the caller to wait for a drain.
    fn write(&self, chunk: Self::Chunk) -> Result<bool>;

    fn end(&self, chunk: Option<Self::Chunk>) -> Result<()>;

    fn destroy(&self, error: Option<Error>);

    fn subscribe(&self, kind: SinkEventKind, listener: Listener<SinkEvent>) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;
}
