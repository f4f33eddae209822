//! Source streams: the producing half of the engine.
//!
//! A [`SourceStream`] owns a [`ChunkQueue`] and a driver task. The driver asks
//! the producer's [`Source::refill`] for data whenever the queue has room, and
//! it is the only place where the stream's notifications are emitted.
//!
//! Consumers choose between two modes:
//!
//! - **paused** (pull): chunks accumulate in the queue and are taken with
//!   [`SourceStream::read`], usually in response to a
//!   [`SourceEvent::Readable`] notification or through
//!   [`SourceStream::read_next`].
//! - **flowing** (push): every chunk is handed to the `Data` listeners as soon
//!   as it is produced. Subscribing to `Data` switches the stream to flowing.
//!
//! A stream starts paused and does not call its producer until a consumer has
//! shown interest.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace, warn};

use crate::chunk::Chunk;
use crate::config::StreamConfig;
use crate::emitter::{Emitter, Event, Listener, ListenerId};
use crate::error::{Error, ProtocolViolation, Result};
use crate::metrics;
use crate::queue::ChunkQueue;
use crate::sources::IterSource;
use crate::traits::{Readable, Source, StreamId};

/// Notifications published by a source stream.
#[derive(Debug)]
pub enum SourceEvent<T> {
    /// A chunk delivered in flowing mode
    Data(T),
    /// Data can be pulled with `read()`
    Readable,
    /// All data has been delivered
    End,
    /// The stream failed
    Error(Error),
    /// The stream released its resources; always the last notification
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceEventKind {
    Data,
    Readable,
    End,
    Error,
    Close,
}

impl<T> Event for SourceEvent<T> {
    type Kind = SourceEventKind;

    fn kind(&self) -> SourceEventKind {
        match self {
            SourceEvent::Data(_) => SourceEventKind::Data,
            SourceEvent::Readable => SourceEventKind::Readable,
            SourceEvent::End => SourceEventKind::End,
            SourceEvent::Error(_) => SourceEventKind::Error,
            SourceEvent::Close => SourceEventKind::Close,
        }
    }
}

/// Consumption mode of a source stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    Paused,
    Flowing,
}

/// Lifecycle of a source stream. Every state but `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Active,
    Ended,
    Errored,
    /// Destroyed without an error before reaching the end
    Destroyed,
}

struct Inner<T> {
    queue: ChunkQueue<T>,
    mode: FlowMode,
    lifecycle: SourceState,
    /// A consumer has registered interest
    started: bool,
    /// The producer should be asked for more data
    demand: bool,
    /// The producer signalled end-of-data
    end_of_data: bool,
    end_emitted: bool,
    need_readable: bool,
    error: Option<Error>,
    error_emitted: bool,
    close_emitted: bool,
}

impl<T: Chunk> Inner<T> {
    fn new(config: &StreamConfig) -> Self {
        Self {
            queue: ChunkQueue::new(config),
            mode: FlowMode::Paused,
            lifecycle: SourceState::Active,
            started: false,
            demand: false,
            end_of_data: false,
            end_emitted: false,
            need_readable: true,
            error: None,
            error_emitted: false,
            close_emitted: false,
        }
    }

    fn is_terminal(&self) -> bool {
        self.lifecycle != SourceState::Active || self.end_emitted
    }

    fn fail(&mut self, error: Error) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.lifecycle = SourceState::Errored;
        self.error = Some(error);
        true
    }

    fn outcome(&self) -> Option<Result<()>> {
        match self.lifecycle {
            SourceState::Active => None,
            SourceState::Ended => Some(Ok(())),
            SourceState::Errored => Some(Err(self.error.clone().unwrap_or(Error::Destroyed))),
            SourceState::Destroyed => Some(Err(Error::PrematureClose)),
        }
    }
}

struct Shared<T> {
    id: StreamId,
    inner: Mutex<Inner<T>>,
    events: Emitter<SourceEvent<T>>,
    /// Wakes the driver
    wake: Notify,
    /// Wakes tasks waiting in `read_next` / `finished`
    ready: Notify,
    /// Interrupts an in-flight refill on destroy
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

    /// Hand a chunk to the `Data` listeners. If they were all removed in the
    /// meantime the chunk goes back to the head of the queue.
    fn deliver(&self, chunk: T) {
        let event = SourceEvent::Data(chunk);
        if self.events.emit(&event) > 0 {
            return;
        }
        if let SourceEvent::Data(chunk) = event {
            trace!(stream = %self.id, "no data listener, chunk requeued");
            self.requeue(chunk);
        }
    }

    fn requeue(&self, chunk: T) {
        let mut inner = self.inner.lock();
        if inner.is_terminal() {
            return;
        }
        inner.queue.requeue(chunk);
        inner.need_readable = true;
        drop(inner);
        self.wake.notify_one();
        self.ready.notify_waiters();
    }

    fn next_step(&self) -> Step<T> {
        let mut inner = self.inner.lock();

        let lifecycle = inner.lifecycle;
        match lifecycle {
            SourceState::Active => {}
            SourceState::Errored if !inner.error_emitted => {
                inner.error_emitted = true;
                return Step::Fail(inner.error.clone().unwrap_or(Error::Destroyed));
            }
            _ if inner.close_emitted => return Step::Stop,
            _ => {
                inner.close_emitted = true;
                return Step::Close;
            }
        }

        if inner.end_emitted {
            return Step::Wait;
        }

        let mode = inner.mode;
        match mode {
            FlowMode::Flowing if self.events.listener_count(SourceEventKind::Data) > 0 => {
                if let Some(chunk) = inner.queue.dequeue() {
                    if !inner.end_of_data && !inner.queue.is_over() {
                        inner.demand = true;
                    }
                    return Step::Deliver(chunk);
                }
            }
            FlowMode::Flowing => {}
            FlowMode::Paused => {
                if inner.need_readable && !inner.queue.is_empty() {
                    inner.need_readable = false;
                    return Step::Announce;
                }
            }
        }

        if inner.end_of_data && inner.queue.is_empty() {
            inner.end_emitted = true;
            return Step::End;
        }

        if self.released.is_cancelled() {
            return Step::Stop;
        }

        if inner.started && inner.demand && !inner.end_of_data && !inner.queue.is_over() {
            inner.demand = false;
            return Step::Refill;
        }

        Step::Wait
    }
}

enum Step<T> {
    Deliver(T),
    Announce,
    Refill,
    End,
    Fail(Error),
    Close,
    Stop,
    Wait,
}

async fn drive<S: Source>(shared: Arc<Shared<S::Item>>, mut source: S) {
    loop {
        match shared.next_step() {
            Step::Deliver(chunk) => {
                trace!(stream = %shared.id, "delivering buffered chunk");
                shared.deliver(chunk);
            }
            Step::Announce => {
                shared.events.emit(&SourceEvent::Readable);
            }
            Step::Refill => {
                let mut ctl = SourceController {
                    shared: shared.clone(),
                    produced: false,
                };
                let result = tokio::select! {
                    biased;
                    _ = shared.abort.cancelled() => None,
                    result = source.refill(&mut ctl) => Some(result),
                };
                match result {
                    Some(Ok(())) if !ctl.produced => {
                        warn!(stream = %shared.id, "refill produced nothing");
                        shared.fail(Error::production(ProtocolViolation::EmptyRefill));
                    }
                    Some(Err(err)) => shared.fail(err.into_production()),
                    _ => {}
                }
                shared.ready.notify_waiters();
                tokio::task::yield_now().await;
            }
            Step::End => {
                debug!(stream = %shared.id, "source ended");
                shared.events.emit(&SourceEvent::End);
                {
                    let mut inner = shared.inner.lock();
                    if inner.lifecycle == SourceState::Active {
                        inner.lifecycle = SourceState::Ended;
                    }
                }
                shared.ready.notify_waiters();
            }
            Step::Fail(err) => {
                metrics::stream_error("source");
                if shared.events.emit(&SourceEvent::Error(err.clone())) == 0 {
                    error!(stream = %shared.id, error = %err, "unhandled source stream error");
                } else {
                    debug!(stream = %shared.id, error = %err, "source errored");
                }
                shared.ready.notify_waiters();
            }
            Step::Close => {
                shared.events.emit(&SourceEvent::Close);
                shared.events.clear();
                shared.ready.notify_waiters();
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
    trace!(stream = %shared.id, "source driver stopped");
}

/// Handle given to [`Source::refill`] for pushing chunks.
pub struct SourceController<T> {
    shared: Arc<Shared<T>>,
    /// `push` or `end` was called during this refill
    produced: bool,
}

impl<T: Chunk> SourceController<T> {
    /// Hand a chunk to the stream.
    ///
    /// Returns `true` while the queue has capacity left. `false` means the
    /// high water mark was exceeded; the chunk is still accepted, but the
    /// producer should stop and wait for the next refill.
    pub fn push(&mut self, chunk: T) -> bool {
        self.produced = true;
        let mut inner = self.shared.inner.lock();
        if inner.is_terminal() {
            return false;
        }
        if inner.end_of_data {
            warn!(stream = %self.shared.id, "chunk pushed after end-of-data");
            inner.fail(Error::Protocol(ProtocolViolation::PushAfterEnd));
            return false;
        }

        metrics::chunk_produced();

        // Flowing with nothing buffered: skip the queue entirely.
        if inner.mode == FlowMode::Flowing
            && inner.queue.is_empty()
            && self.shared.events.listener_count(SourceEventKind::Data) > 0
        {
            inner.demand = true;
            drop(inner);
            trace!(stream = %self.shared.id, "delivering chunk");
            self.shared.deliver(chunk);
            return true;
        }

        let over = inner.queue.enqueue(chunk);
        if over {
            metrics::backpressure();
        } else {
            inner.demand = true;
        }
        drop(inner);
        self.shared.ready.notify_waiters();
        !over
    }

    /// Signal that no more data will be produced.
    pub fn end(&mut self) {
        self.produced = true;
        let mut inner = self.shared.inner.lock();
        if inner.end_of_data || inner.is_terminal() {
            return;
        }
        inner.end_of_data = true;
        drop(inner);
        debug!(stream = %self.shared.id, "end of data");
        self.shared.ready.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.inner.lock().mode == FlowMode::Paused
    }

    /// Aggregate size of the chunks currently buffered
    pub fn buffered_size(&self) -> usize {
        self.shared.inner.lock().queue.size()
    }
}

/// A chunk-producing stream with backpressure.
pub struct SourceStream<T> {
    shared: Arc<Shared<T>>,
    _release: Arc<DropGuard>,
}

impl<T> Clone for SourceStream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _release: self._release.clone(),
        }
    }
}

impl<T: Chunk> fmt::Debug for SourceStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("SourceStream")
            .field("id", &self.shared.id)
            .field("state", &inner.lifecycle)
            .field("mode", &inner.mode)
            .field("buffered", &inner.queue.size())
            .finish()
    }
}

impl<T: Chunk> SourceStream<T> {
    /// Create a stream driven by `source`.
    ///
    /// Spawns the stream's driver task, so it must be called from within a
    /// Tokio runtime.
    pub fn new<S>(source: S, config: StreamConfig) -> Result<Self>
    where
        S: Source<Item = T>,
    {
        config.validate()?;

        let released = CancellationToken::new();
        let shared = Arc::new(Shared {
            id: StreamId::next(),
            inner: Mutex::new(Inner::new(&config)),
            events: Emitter::new(),
            wake: Notify::new(),
            ready: Notify::new(),
            abort: CancellationToken::new(),
            released: released.clone(),
        });
        debug!(
            stream = %shared.id,
            high_water_mark = config.high_water_mark,
            object_mode = config.object_mode,
            "source stream created"
        );

        tokio::spawn(drive(shared.clone(), source));

        Ok(Self {
            shared,
            _release: Arc::new(released.drop_guard()),
        })
    }

    /// Create a stream producing the items of an iterator, then ending.
    pub fn from_items<I>(items: I, config: StreamConfig) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(IterSource::new(items), config)
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn state(&self) -> SourceState {
        self.shared.inner.lock().lifecycle
    }

    pub fn mode(&self) -> FlowMode {
        self.shared.inner.lock().mode
    }

    pub fn is_paused(&self) -> bool {
        self.mode() == FlowMode::Paused
    }

    /// The error that terminated the stream, if any
    pub fn error(&self) -> Option<Error> {
        self.shared.inner.lock().error.clone()
    }

    /// Aggregate size of the chunks currently buffered
    pub fn buffered_size(&self) -> usize {
        self.shared.inner.lock().queue.size()
    }

    /// Number of chunks currently buffered
    pub fn buffered_len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.inner.lock().queue.high_water_mark()
    }

    /// Take the oldest buffered chunk, or `None` if nothing is buffered or the
    /// stream has ended.
    ///
    /// Reading registers consumption intent: the producer is asked for more
    /// data whenever the queue drops back under its high water mark.
    pub fn read(&self) -> Option<T> {
        let mut inner = self.shared.inner.lock();
        if inner.is_terminal() {
            return None;
        }
        inner.started = true;
        let chunk = inner.queue.dequeue();
        if inner.queue.is_empty() {
            inner.need_readable = true;
        }
        if !inner.end_of_data && !inner.queue.is_over() {
            inner.demand = true;
        }
        drop(inner);
        self.shared.wake.notify_one();
        chunk
    }

    /// Return a chunk to the head of the queue so it is the next one read or
    /// delivered. Dropped if the stream is no longer active.
    pub fn unshift(&self, chunk: T) {
        self.shared.requeue(chunk);
    }

    /// Wait for the next chunk in pull mode.
    ///
    /// Resolves with `Ok(None)` once the stream has ended and its queue is
    /// empty. Chunks delivered to `Data` listeners in flowing mode never pass
    /// through here.
    pub async fn read_next(&self) -> Result<Option<T>> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.read() {
                return Ok(Some(chunk));
            }
            {
                let inner = self.shared.inner.lock();
                match inner.lifecycle {
                    SourceState::Active if inner.end_of_data && inner.queue.is_empty() => {
                        return Ok(None)
                    }
                    SourceState::Active => {}
                    SourceState::Ended => return Ok(None),
                    SourceState::Errored => {
                        return Err(inner.error.clone().unwrap_or(Error::Destroyed))
                    }
                    SourceState::Destroyed => return Err(Error::PrematureClose),
                }
            }
            notified.await;
        }
    }

    /// Adapt the stream into a [`futures_core::Stream`] of pulled chunks.
    pub fn into_stream(self) -> impl futures_core::Stream<Item = Result<T>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let source = state?;
            match source.read_next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(source))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Wait until the stream reaches a terminal state.
    ///
    /// Resolves with `Ok(())` after `End`, with the stream's error if it
    /// failed, and with [`Error::PrematureClose`] if it was destroyed without
    /// one.
    pub async fn finished(&self) -> Result<()> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.shared.inner.lock().outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Switch to flowing mode. No effect if already flowing or terminal.
    pub fn resume(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.is_terminal() || inner.mode == FlowMode::Flowing {
            return;
        }
        inner.mode = FlowMode::Flowing;
        inner.started = true;
        inner.demand = true;
        drop(inner);
        debug!(stream = %self.shared.id, "resumed");
        self.shared.wake.notify_one();
    }

    /// Switch to paused mode. No effect if already paused.
    pub fn pause(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.mode == FlowMode::Paused {
            return;
        }
        inner.mode = FlowMode::Paused;
        drop(inner);
        debug!(stream = %self.shared.id, "paused");
    }

    /// Tear the stream down.
    ///
    /// With an error the stream becomes `Errored` and emits `Error`; without
    /// one it becomes `Destroyed`. Either way `Close` follows and any
    /// in-flight refill is abandoned. No effect on a terminal stream.
    pub fn destroy(&self, error: Option<Error>) {
        let mut inner = self.shared.inner.lock();
        if inner.is_terminal() {
            return;
        }
        match error {
            Some(err) => {
                inner.lifecycle = SourceState::Errored;
                inner.error = Some(err);
            }
            None => inner.lifecycle = SourceState::Destroyed,
        }
        drop(inner);
        debug!(stream = %self.shared.id, "source destroyed");
        self.shared.abort.cancel();
        self.shared.wake.notify_one();
        self.shared.ready.notify_waiters();
    }

    /// Register a listener for one kind of notification.
    pub fn subscribe(
        &self,
        kind: SourceEventKind,
        listener: Listener<SourceEvent<T>>,
    ) -> ListenerId {
        let id = self.shared.events.on(kind, listener);
        match kind {
            SourceEventKind::Data => {
                self.resume();
                // Chunks may be waiting for a listener while already flowing.
                self.shared.wake.notify_one();
            }
            SourceEventKind::Readable => {
                let mut inner = self.shared.inner.lock();
                if !inner.is_terminal() {
                    inner.mode = FlowMode::Paused;
                    inner.started = true;
                    inner.need_readable = true;
                    inner.demand = true;
                }
                drop(inner);
                self.shared.wake.notify_one();
            }
            _ => {}
        }
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.events.off(id)
    }

    pub fn listener_count(&self, kind: SourceEventKind) -> usize {
        self.shared.events.listener_count(kind)
    }

    /// Receive each chunk as it is produced. Switches the stream to flowing.
    pub fn on_data<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.subscribe(
            SourceEventKind::Data,
            Box::new(move |event| {
                if let SourceEvent::Data(chunk) = event {
                    f(chunk)
                }
            }),
        )
    }

    /// Be told when data can be pulled with [`read`](Self::read).
    pub fn on_readable<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut() + Send + 'static,
    {
        self.subscribe(SourceEventKind::Readable, Box::new(move |_| f()))
    }

    pub fn on_end<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut() + Send + 'static,
    {
        self.subscribe(SourceEventKind::End, Box::new(move |_| f()))
    }

    pub fn on_error<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.subscribe(
            SourceEventKind::Error,
            Box::new(move |event| {
                if let SourceEvent::Error(err) = event {
                    f(err)
                }
            }),
        )
    }

    pub fn on_close<F>(&self, mut f: F) -> ListenerId
    where
        F: FnMut() + Send + 'static,
    {
        self.subscribe(SourceEventKind::Close, Box::new(move |_| f()))
    }
}

impl<T: Chunk> Readable for SourceStream<T> {
    type Chunk = T;

    fn id(&self) -> StreamId {
        SourceStream::id(self)
    }

    fn state(&self) -> SourceState {
        SourceStream::state(self)
    }

    fn error(&self) -> Option<Error> {
        SourceStream::error(self)
    }

    fn read(&self) -> Option<T> {
        SourceStream::read(self)
    }

    fn unshift(&self, chunk: T) {
        SourceStream::unshift(self, chunk)
    }

    fn pause(&self) {
        SourceStream::pause(self)
    }

    fn resume(&self) {
        SourceStream::resume(self)
    }

    fn is_paused(&self) -> bool {
        SourceStream::is_paused(self)
    }

    fn destroy(&self, error: Option<Error>) {
        SourceStream::destroy(self, error)
    }

    fn subscribe(&self, kind: SourceEventKind, listener: Listener<SourceEvent<T>>) -> ListenerId {
        SourceStream::subscribe(self, kind, listener)
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        SourceStream::unsubscribe(self, id)
    }
}
