//! Sink streams: the consuming half of the engine.
//!
//! A [`SinkStream`] buffers written chunks in a [`ChunkQueue`] and hands them,
//! one at a time and in write order, to the consumer's [`Sink::write`]. The
//! chunk being processed keeps counting toward the queue size until its
//! future resolves, so `write()` reports backpressure against everything not
//! yet consumed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace};

use crate::chunk::Chunk;
use crate::config::StreamConfig;
use crate::emitter::{Emitter, Event, Listener, ListenerId};
use crate::error::{Error, ProtocolViolation, Result};
use crate::metrics;
use crate::queue::ChunkQueue;
use crate::traits::{Sink, StreamId, Writable};

/// Notifications published by a sink stream.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// The queue emptied after a write reported backpressure
    Drain,
    /// Every chunk was consumed after `end()`
    Finish,
    /// The stream failed
    Error(Error),
    /// The stream released its resources; always the last notification
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkEventKind {
    Drain,
    Finish,
    Error,
    Close,
}

impl Event for SinkEvent {
    type Kind = SinkEventKind;

    fn kind(&self) -> SinkEventKind {
        match self {
            SinkEvent::Drain => SinkEventKind::Drain,
            SinkEvent::Finish => SinkEventKind::Finish,
            SinkEvent::Error(_) => SinkEventKind::Error,
            SinkEvent::Close => SinkEventKind::Close,
        }
    }
}

/// Lifecycle of a sink stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Writable,
    /// A write exceeded the high water mark; waiting for the queue to empty
    Draining,
    Ended,
    Errored,
    /// Destroyed without an error before finishing
    Destroyed,
}

impl SinkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SinkState::Ended | SinkState::Errored | SinkState::Destroyed
        )
    }
}

struct Inner<T> {
    queue: ChunkQueue<T>,
    lifecycle: SinkState,
    need_drain: bool,
    /// `end()` was called
    ending: bool,
    finishing: bool,
    error: Option<Error>,
    error_emitted: bool,
    close_emitted: bool,
}

impl<T: Chunk> Inner<T> {
    fn new(config: &StreamConfig) -> Self {
        Self {
            queue: ChunkQueue::new(config),
            lifecycle: SinkState::Writable,
            need_drain: false,
            ending: false,
            finishing: false,
            error: None,
            error_emitted: false,
            close_emitted: false,
        }
    }

    fn fail(&mut self, error: Error) -> bool {
        if self.lifecycle.is_terminal() {
            return false;
        }
        self.lifecycle = SinkState::Errored;
        self.error = Some(error);
        true
    }

    fn closed_error(&self) -> Error {
        match self.lifecycle {
            SinkState::Errored => self.error.clone().unwrap_or(Error::Destroyed),
            _ => Error::Destroyed,
        }
    }
}

struct Shared<T> {
    id: StreamId,
    inner: Mutex<Inner<T>>,
    events: Emitter<SinkEvent>,
    /// Wakes the driver
    wake: Notify,
    /// Wakes tasks waiting in `drained` / `finished`
    signal: Notify,
    /// Interrupts an in-flight write on destroy
    abort: CancellationToken,
    /// Cancelled once every handle has been dropped
    released: CancellationToken,
}

impl<T: Chunk> Shared<T> {
    fn fail(&self, error: Error) {
        let failed = self.inner.lock().fail(error);
        if failed {
            self.wake.notify_one();
        }
    }

    fn next_step(&self) -> Step<T> {
        let mut inner = self.inner.lock();

        let lifecycle = inner.lifecycle;
        match lifecycle {
            SinkState::Writable | SinkState::Draining => {}
            SinkState::Errored if !inner.error_emitted => {
                inner.error_emitted = true;
                return Step::Fail(inner.error.clone().unwrap_or(Error::Destroyed));
            }
            _ if inner.close_emitted => return Step::Stop,
            _ => {
                inner.close_emitted = true;
                return Step::Close;
            }
        }

        if inner.finishing {
            return Step::Wait;
        }
        if let Some((chunk, size)) = inner.queue.take_in_flight() {
            return Step::Write(chunk, size);
        }
        if inner.ending {
            inner.finishing = true;
            return Step::Finish;
        }
        // Nothing queued and nobody left to write more.
        if self.released.is_cancelled() {
            return Step::Stop;
        }
        Step::Wait
    }

    /// Account for a consumed chunk. Returns whether a drain should be
    /// announced.
    fn settle(&self, size: usize, result: Result<()>) -> bool {
        let mut inner = self.inner.lock();
        inner.queue.settle(size);
        if let Err(err) = result {
            inner.fail(err.into_consumption());
            return false;
        }
        if inner.need_drain
            && inner.queue.size() == 0
            && !inner.ending
            && !inner.lifecycle.is_terminal()
        {
            inner.need_drain = false;
            inner.lifecycle = SinkState::Writable;
            return true;
        }
        false
    }
}

enum Step<T> {
    Write(T, usize),
    Finish,
    Fail(Error),
    Close,
    Stop,
    Wait,
}

async fn drive<S: Sink>(shared: Arc<Shared<S::Item>>, mut sink: S) {
    loop {
        match shared.next_step() {
            Step::Write(chunk, size) => {
                let result = tokio::select! {
                    biased;
                    _ = shared.abort.cancelled() => None,
                    result = sink.write(chunk) => Some(result),
                };
                let Some(result) = result else {
                    trace!(stream = %shared.id, "in-flight write abandoned");
                    shared.inner.lock().queue.settle(size);
                    shared.signal.notify_waiters();
                    continue;
                };
                if result.is_ok() {
                    metrics::chunk_consumed();
                }
                if shared.settle(size, result) {
                    metrics::drained();
                    trace!(stream = %shared.id, "sink drained");
                    shared.events.emit(&SinkEvent::Drain);
                }
                shared.signal.notify_waiters();
                tokio::task::yield_now().await;
            }
            Step::Finish => {
                let result = tokio::select! {
                    biased;
                    _ = shared.abort.cancelled() => Ok(()),
                    result = sink.finish() => result,
                };
                match result {
                    Err(err) => shared.fail(err.into_consumption()),
                    Ok(()) => {
                        let finished = !shared.inner.lock().lifecycle.is_terminal();
                        if finished {
                            debug!(stream = %shared.id, "sink finished");
                            shared.events.emit(&SinkEvent::Finish);
                            let mut inner = shared.inner.lock();
                            if !inner.lifecycle.is_terminal() {
                                inner.lifecycle = SinkState::Ended;
                            }
                        }
                    }
                }
                shared.signal.notify_waiters();
            }
            Step::Fail(err) => {
                metrics::stream_error("sink");
                if shared.events.emit(&SinkEvent::Error(err.clone())) == 0 {
                    error!(stream = %shared.id, error = %err, "unhandled sink stream error");
                } else {
                    debug!(stream = %shared.id, error = %err, "sink errored");
                }
                shared.signal.notify_waiters();
            }
            Step::Close => {
                shared.events.emit(&SinkEvent::Close);
                shared.events.clear();
                shared.signal.notify_waiters();
            }
            Step::Stop => break,
            Step::Wait => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = shared.released.cancelled() => {}
                }
            }
        }
    }
    trace!(stream = %shared.id, "sink driver stopped");
}

/// A chunk-consuming stream with backpressure.
pub struct SinkStream<T> {
    shared: Arc<Shared<T>>,
    _release: Arc<DropGuard>,
}

impl<T> Clone for SinkStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _release: self._release.clone(),
        }
    }
}

impl<T: Chunk> fmt::Debug for SinkStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("SinkStream")
            .field("id", &self.shared.id)
            .field("state", &inner.lifecycle)
            .field("buffered", &inner.queue.size())
            .field("ending", &inner.ending)
            .finish()
    }
}

impl<T: Chunk> SinkStream<T> {
    /// Create a stream draining into `sink`.
    ///
    /// Spawns the stream's driver task, so it must be called from within a
    /// Tokio runtime.
    pub fn new<S>(sink: S, config: StreamConfig) -> Result<Self>
    where
        S: Sink<Item = T>,
    {
        config.validate()?;

        let released = CancellationToken::new();
        let shared = Arc::new(Shared {
            id: StreamId::next(),
            inner: Mutex::new(Inner::new(&config)),
            events: Emitter::new(),
            wake: Notify::new(),
            signal: Notify::new(),
            abort: CancellationToken::new(),
            released: released.clone(),
        });
        debug!(
            stream = %shared.id,
            high_water_mark = config.high_water_mark,
            object_mode = config.object_mode,
            "sink stream created"
        );

        tokio::spawn(drive(shared.clone(), sink));

        Ok(Self {
            shared,
            _release: Arc::new(released.drop_guard()),
        })
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn state(&self) -> SinkState {
        self.shared.inner.lock().lifecycle
    }

    /// Whether `end()` has been called
    pub fn is_ending(&self) -> bool {
        self.shared.inner.lock().ending
    }

    /// Whether a write reported backpressure that has not drained yet
    pub fn needs_drain(&self) -> bool {
        self.shared.inner.lock().need_drain
    }

    /// The error that terminated the stream, if any
    pub fn error(&self) -> Option<Error> {
        self.shared.inner.lock().error.clone()
    }

    /// Aggregate size of queued and in-flight chunks
    pub fn buffered_size(&self) -> usize {
        self.shared.inner.lock().queue.size()
    }

    /// Number of chunks waiting behind the one in flight
    pub fn buffered_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.inner.lock().queue.high_water_mark()
    }

    /// Queue a chunk for consumption.
    ///
    /// Returns `Ok(false)` when the unconsumed data now exceeds the high water
    /// mark; the chunk is still queued, but the caller should wait for
    /// [`SinkEvent::Drain`] before writing more. Writing after `end()` is a
    /// protocol violation that also fails the stream.
    pub fn write(&self, chunk: T) -> Result<bool> {
        let mut inner = self.shared.inner.lock();
        if matches!(inner.lifecycle, SinkState::Errored | SinkState::Destroyed) {
            return Err(Error::Destroyed);
        }
        if inner.ending || inner.lifecycle == SinkState::Ended {
            let err = Error::Protocol(ProtocolViolation::WriteAfterEnd);
            let failed = inner.fail(err.clone());
            drop(inner);
            if failed {
                self.shared.wake.notify_one();
            }
            return Err(err);
        }

        let over = inner.queue.enqueue(chunk);
        if over {
            if !inner.need_drain {
                metrics::backpressure();
                trace!(stream = %self.shared.id, "sink over high water mark");
            }
            inner.need_drain = true;
            inner.lifecycle = SinkState::Draining;
        }
        drop(inner);
        self.shared.wake.notify_one();
        Ok(!over)
    }

    /// Queue an optional final chunk and refuse further writes. The stream
    /// finishes once everything queued has been consumed.
    pub fn end(&self, chunk: Option<T>) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if matches!(inner.lifecycle, SinkState::Errored | SinkState::Destroyed) {
            return Err(Error::Destroyed);
        }
        if inner.ending {
            return Err(Error::Protocol(ProtocolViolation::EndCalledTwice));
        }
        if let Some(chunk) = chunk {
            inner.queue.enqueue(chunk);
        }
        inner.ending = true;
        drop(inner);
        debug!(stream = %self.shared.id, "sink ending");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Write a chunk, waiting for a drain if it reported backpressure.
    pub async fn send(&self, chunk: T) -> Result<()> {
        if !self.write(chunk)? {
            self.drained().await?;
        }
        Ok(())
    }

    /// Write every chunk of `stream` with backpressure, then end the sink and
    /// wait for it to finish.
    pub async fn send_all<S>(&self, stream: S) -> Result<()>
    where
        S: futures_core::Stream<Item = T>,
    {
        tokio::pin!(stream);
        while let Some(chunk) = stream.next().await {
            self.send(chunk).await?;
        }
        self.end(None)?;
        self.finished().await
    }

    /// Wait until no backpressure is outstanding.
    pub async fn drained(&self) -> Result<()> {
        loop {
            let notified = self.shared.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.shared.inner.lock();
                match inner.lifecycle {
                    SinkState::Errored | SinkState::Destroyed => {
                        return Err(inner.closed_error())
                    }
                    SinkState::Ended => return Ok(()),
                    _ if !inner.need_drain => return Ok(()),
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Wait until the stream reaches a terminal state.
    ///
    /// Resolves with `Ok(())` after `Finish`, with the stream's error if it
    /// failed, and with [`Error::PrematureClose`] if it was destroyed without
    /// one.
    pub async fn finished(&self) -> Result<()> {
        loop {
            let notified = self.shared.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.shared.inner.lock();
                match inner.lifecycle {
                    SinkState::Ended => return Ok(()),
                    SinkState::Errored => return Err(inner.closed_error()),
                    SinkState::Destroyed => return Err(Error::PrematureClose),
                    SinkState::Writable | SinkState::Draining => {}
                }
            }
            notified.await;
        }
    }

    /// Tear the stream down, discarding anything still queued.
    ///
    /// With an error the stream becomes `Errored` and emits `Error`; without
    /// one it becomes `Destroyed`. Either way `Close` follows. No effect on a
    /// terminal stream.
    pub fn destroy(&self, error: Option<Error>) {
        let mut inner = self.shared.inner.lock();
        if inner.lifecycle.is_terminal() {
            return;
        }
        match error {
            Some(err) => {
                inner.lifecycle = SinkState::Errored;
                inner.error = Some(err);
            }
            None => inner.lifecycle = SinkState::Destroyed,
        }
        drop(inner);
        debug!(stream = %self.shared.id, "sink destroyed");
        self.shared.abort.cancel();
        self.shared.wake.notify_one();
        self.shared.signal.notify_waiters();
    }

    /// Register a listener for one kind of notification.
    pub fn subscribe(&self, kind: SinkEventKind, listener: Listener<SinkEvent>) -> ListenerId {
        self.shared.events.on(kind, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    pub fn listener_count(&self, kind: SinkEventKind) -> usize {
        self.shared.events.listener_count(kind)
    }

    pub fn on_drain<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut() + Send + 'static,
    {
        self.subscribe(SinkEventKind::Drain, Box::new(move |_| f()))
    }

    pub fn on_finish<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut() + Send + 'static,
    {
        self.subscribe(SinkEventKind::Finish, Box::new(move |_| f()))
    }

    pub fn on_error<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.subscribe(
            SinkEventKind::Error,
            Box::new(move |event| {
                if let SinkEvent::Error(err) = event {
                    f(err)
                }
            }),
        )
    }

    pub fn on_close<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut() + Send + 'static,
    {
        self.subscribe(SinkEventKind::Close, Box::new(move |_| f()))
    }
}

impl<T: Chunk> Writable for SinkStream<T> {
    type Chunk = T;

    fn id(&self) -> StreamId {
        SinkStream::id(self)
    }

    fn state(&self) -> SinkState {
        SinkStream::state(self)
    }

    fn error(&self) -> Option<Error> {
        SinkStream::error(self)
    }

    fn write(&self, chunk: T) -> Result<bool> {
        SinkStream::write(self, chunk)
    }

    fn end(&self, chunk: Option<T>) -> Result<()> {
        SinkStream::end(self, chunk)
    }

    fn destroy(&self, error: Option<Error>) {
        SinkStream::destroy(self, error)
    }

    fn subscribe(&self, kind: SinkEventKind, listener: Listener<SinkEvent>) -> ListenerId {
        SinkStream::subscribe(self, kind, listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        SinkStream::unsubscribe(self, id)
    }
}
