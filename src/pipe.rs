//! The unmanaged connector.
//!
//! A [`Pipe`] forwards every chunk of a source to one or more sinks and turns
//! the sinks' backpressure into pause/resume calls on the source. It has no
//! buffer of its own; a chunk that arrives after its last sink was detached
//! goes back to the source.
//!
//! Errors do not cross a pipe. A failing sink is detached and the source is
//! left paused; a failing source leaves its sinks open and never ended. Code
//! that needs one outcome for the whole chain should use
//! [`Pipeline`](crate::pipeline::Pipeline) instead.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::emitter::ListenerId;
use crate::sink::{SinkEvent, SinkEventKind};
use crate::source::{SourceEvent, SourceEventKind, SourceStream};
use crate::traits::{Readable, StreamId, Writable};

/// Behaviour of a [`Pipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// End every attached sink when the source ends
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

impl PipeOptions {
    pub fn end(mut self, end: bool) -> Self {
        self.end = end;
        self
    }
}

struct Attached<W> {
    sink: W,
    listeners: Vec<ListenerId>,
}

struct PipeState<W> {
    sinks: Vec<Attached<W>>,
    /// Sinks whose last write reported backpressure
    awaiting_drain: HashSet<StreamId>,
    source_listeners: Vec<ListenerId>,
}

struct PipeInner<R, W> {
    source: R,
    options: PipeOptions,
    state: Mutex<PipeState<W>>,
}

/// A live connection from one source to its sinks.
///
/// Dropping the handle does not disconnect anything: the listeners installed
/// on both streams keep the connection alive until the source ends or closes,
/// or until every sink has been detached.
pub struct Pipe<R, W> {
    inner: Arc<PipeInner<R, W>>,
}

impl<R, W> Clone for Pipe<R, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R, W> fmt::Debug for Pipe<R, W>
where
    R: Readable,
    W: Writable<Chunk = R::Chunk>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pipe")
            .field("source", &self.inner.source.id())
            .field(
                "sinks",
                &state.sinks.iter().map(|a| a.sink.id()).collect::<Vec<_>>(),
            )
            .field("awaiting_drain", &state.awaiting_drain.len())
            .finish()
    }
}

/// Connect `source` to `sink` with the default options.
pub fn connect<R, W>(source: &R, sink: &W) -> Pipe<R, W>
where
    R: Readable,
    R::Chunk: Clone,
    W: Writable<Chunk = R::Chunk>,
{
    Pipe::with_options(source, sink, PipeOptions::default())
}

/// Detach `sink` from `pipe`, leaving the source paused if it was the last
/// one. Returns whether the sink was attached.
pub fn disconnect<R, W>(pipe: &Pipe<R, W>, sink: &W) -> bool
where
    R: Readable,
    R::Chunk: Clone,
    W: Writable<Chunk = R::Chunk>,
{
    pipe.disconnect(sink)
}

impl<R, W> Pipe<R, W>
where
    R: Readable,
    R::Chunk: Clone,
    W: Writable<Chunk = R::Chunk>,
{
    pub fn with_options(source: &R, sink: &W, options: PipeOptions) -> Self {
        let pipe = Self {
            inner: Arc::new(PipeInner {
                source: source.clone(),
                options,
                state: Mutex::new(PipeState {
                    sinks: Vec::new(),
                    awaiting_drain: HashSet::new(),
                    source_listeners: Vec::new(),
                }),
            }),
        };
        pipe.attach(sink);
        pipe
    }

    pub fn source(&self) -> &R {
        &self.inner.source
    }

    pub fn options(&self) -> PipeOptions {
        self.inner.options
    }

    /// Add another sink to this connection. Every chunk is cloned to each
    /// sink. Returns `false` if the sink was already attached.
    pub fn attach(&self, sink: &W) -> bool {
        let mut state = self.inner.state.lock();
        let id = sink.id();
        if state.sinks.iter().any(|a| a.sink.id() == id) {
            return false;
        }

        let listeners = self.inner.listen_to_sink(sink);
        state.sinks.push(Attached {
            sink: sink.clone(),
            listeners,
        });
        debug!(source = %self.inner.source.id(), sink = %id, "sink attached");

        if state.source_listeners.is_empty() {
            // Subscribing to `Data` puts the source in flowing mode.
            state.source_listeners = self.inner.listen_to_source();
        } else if state.awaiting_drain.is_empty() {
            self.inner.source.resume();
        }
        true
    }

    /// Detach one sink. When it was the last one the source is paused and
    /// left where production currently stands; a later `attach` or
    /// [`connect`] resumes from there.
    pub fn disconnect(&self, sink: &W) -> bool {
        let mut state = self.inner.state.lock();
        self.inner.detach(&mut state, sink.id())
    }

    pub fn disconnect_all(&self) {
        let mut state = self.inner.state.lock();
        let ids: Vec<_> = state.sinks.iter().map(|a| a.sink.id()).collect();
        for id in ids {
            self.inner.detach(&mut state, id);
        }
    }

    pub fn is_connected(&self, sink: &W) -> bool {
        let id = sink.id();
        self.inner
            .state
            .lock()
            .sinks
            .iter()
            .any(|a| a.sink.id() == id)
    }

    pub fn sink_count(&self) -> usize {
        self.inner.state.lock().sinks.len()
    }

    /// Whether the connection still forwards data
    pub fn is_active(&self) -> bool {
        !self.inner.state.lock().source_listeners.is_empty()
    }
}

impl<R, W> PipeInner<R, W>
where
    R: Readable,
    R::Chunk: Clone,
    W: Writable<Chunk = R::Chunk>,
{
    fn listen_to_source(self: &Arc<Self>) -> Vec<ListenerId> {
        let on_data = self.clone();
        let on_end = self.clone();
        let on_close = self.clone();
        vec![
            self.source.subscribe(
                SourceEventKind::Data,
                Box::new(move |event| {
                    if let SourceEvent::Data(chunk) = event {
                        on_data.forward(chunk);
                    }
                }),
            ),
            self.source
                .subscribe(SourceEventKind::End, Box::new(move |_| on_end.source_ended())),
            self.source.subscribe(
                SourceEventKind::Close,
                Box::new(move |_| {
                    let mut state = on_close.state.lock();
                    on_close.teardown(&mut state);
                }),
            ),
        ]
    }

    fn listen_to_sink(self: &Arc<Self>, sink: &W) -> Vec<ListenerId> {
        let id = sink.id();
        let on_drain = self.clone();
        let mut listeners = vec![sink.subscribe(
            SinkEventKind::Drain,
            Box::new(move |_| on_drain.sink_drained(id)),
        )];
        for kind in [
            SinkEventKind::Error,
            SinkEventKind::Finish,
            SinkEventKind::Close,
        ] {
            let pipe = self.clone();
            listeners.push(sink.subscribe(
                kind,
                Box::new(move |event| {
                    if let SinkEvent::Error(err) = event {
                        debug!(sink = %id, error = %err, "detaching failed sink");
                    }
                    let mut state = pipe.state.lock();
                    pipe.detach(&mut state, id);
                }),
            ));
        }
        listeners
    }

    fn forward(&self, chunk: &R::Chunk) {
        let mut state = self.state.lock();
        if state.sinks.is_empty() {
            // Detached while this chunk was on its way.
            self.source.unshift(chunk.clone());
            return;
        }
        let PipeState {
            sinks,
            awaiting_drain,
            ..
        } = &mut *state;

        let mut rejected = Vec::new();
        for attached in sinks.iter() {
            let id = attached.sink.id();
            match attached.sink.write(chunk.clone()) {
                Ok(true) => {}
                Ok(false) => {
                    trace!(source = %self.source.id(), sink = %id, "sink needs drain");
                    awaiting_drain.insert(id);
                }
                Err(err) => {
                    debug!(sink = %id, error = %err, "sink rejected chunk");
                    rejected.push(id);
                }
            }
        }
        for id in rejected {
            self.detach(&mut state, id);
        }

        if !state.awaiting_drain.is_empty() && !state.sinks.is_empty() {
            self.source.pause();
        }
    }

    fn sink_drained(&self, id: StreamId) {
        let mut state = self.state.lock();
        if state.awaiting_drain.remove(&id)
            && state.awaiting_drain.is_empty()
            && !state.sinks.is_empty()
        {
            trace!(source = %self.source.id(), "all sinks drained");
            self.source.resume();
        }
    }

    fn source_ended(&self) {
        let mut state = self.state.lock();
        if self.options.end {
            for attached in &state.sinks {
                if let Err(err) = attached.sink.end(None) {
                    debug!(sink = %attached.sink.id(), error = %err, "could not end sink");
                }
            }
        }
        self.teardown(&mut state);
    }

    fn detach(&self, state: &mut PipeState<W>, id: StreamId) -> bool {
        let Some(pos) = state.sinks.iter().position(|a| a.sink.id() == id) else {
            return false;
        };
        let attached = state.sinks.remove(pos);
        for listener in attached.listeners {
            attached.sink.unsubscribe(listener);
        }
        state.awaiting_drain.remove(&id);
        debug!(source = %self.source.id(), sink = %id, "sink detached");

        if state.sinks.is_empty() {
            self.source.pause();
            for listener in state.source_listeners.drain(..) {
                self.source.unsubscribe(listener);
            }
        } else if state.awaiting_drain.is_empty() {
            self.source.resume();
        }
        true
    }

    /// Drop every listener this pipe installed.
    fn teardown(&self, state: &mut PipeState<W>) {
        for attached in state.sinks.drain(..) {
            for listener in attached.listeners {
                attached.sink.unsubscribe(listener);
            }
        }
        for listener in state.source_listeners.drain(..) {
            self.source.unsubscribe(listener);
        }
        state.awaiting_drain.clear();
    }
}

impl<T> SourceStream<T>
where
    T: crate::chunk::Chunk + Clone,
{
    /// Connect this source to `sink` without error propagation.
    /// See [`connect`].
    pub fn pipe<W>(&self, sink: &W) -> Pipe<Self, W>
    where
        W: Writable<Chunk = T>,
    {
        connect(self, sink)
    }
}
