//! Managed composition of a source and its sinks.
//!
//! A [`Pipeline`] wires its stages together with a [`Pipe`] and adds a single
//! aggregating observer on top. The first error anywhere destroys every stage
//! with that error; the pipeline then resolves exactly once, with `Ok(())`
//! after every sink has finished or with the first error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pipe::{Pipe, PipeOptions};
use crate::sink::{SinkEvent, SinkEventKind, SinkState};
use crate::source::{SourceEvent, SourceEventKind, SourceState};
use crate::traits::{Readable, Writable};

/// A source feeding one or more sinks, with one shared outcome.
pub struct Pipeline<R, W> {
    source: R,
    sinks: Vec<W>,
}

impl<R, W> Pipeline<R, W>
where
    R: Readable,
    R::Chunk: Clone,
    W: Writable<Chunk = R::Chunk>,
{
    /// Create a new pipeline
    pub fn new(source: &R, sink: &W) -> Self {
        Self {
            source: source.clone(),
            sinks: vec![sink.clone()],
        }
    }

    /// Also feed every chunk to `sink`
    pub fn tee(mut self, sink: &W) -> Self {
        self.sinks.push(sink.clone());
        self
    }

    /// Connect the stages and wait for the outcome.
    pub async fn run(self) -> Result<()> {
        self.start().await?
    }

    /// Run the pipeline on its own task and hand the outcome to `callback`,
    /// exactly once.
    pub fn run_with<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.run().await;
            callback(outcome);
        })
    }

    fn start(self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let outcome = Arc::new(Outcome {
            tx: Mutex::new(Some(tx)),
            unfinished: AtomicUsize::new(self.sinks.len()),
            source: self.source,
            sinks: self.sinks,
        });

        if let Some(err) = outcome.terminal_stage() {
            outcome.fail(err);
            return rx;
        }

        outcome.observe();

        let mut sinks = outcome.sinks.iter();
        if let Some(first) = sinks.next() {
            let pipe = Pipe::with_options(&outcome.source, first, PipeOptions::default());
            for sink in sinks {
                pipe.attach(sink);
            }
        }
        debug!(
            source = %outcome.source.id(),
            sinks = outcome.sinks.len(),
            "pipeline started"
        );
        rx
    }
}

/// Connect `source` to `sink` as a managed pipeline and wait for the outcome.
pub async fn pipeline<R, W>(source: &R, sink: &W) -> Result<()>
where
    R: Readable,
    R::Chunk: Clone,
    W: Writable<Chunk = R::Chunk>,
{
    Pipeline::new(source, sink).run().await
}

struct Outcome<R, W> {
    tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    source: R,
    sinks: Vec<W>,
    unfinished: AtomicUsize,
}

impl<R, W> Outcome<R, W>
where
    R: Readable,
    W: Writable<Chunk = R::Chunk>,
{
    fn terminal_stage(&self) -> Option<Error> {
        match self.source.state() {
            SourceState::Active => {}
            SourceState::Errored => {
                return Some(self.source.error().unwrap_or(Error::PrematureClose))
            }
            SourceState::Ended | SourceState::Destroyed => return Some(Error::PrematureClose),
        }
        self.sinks.iter().find_map(|sink| match sink.state() {
            SinkState::Writable | SinkState::Draining => None,
            SinkState::Errored => Some(sink.error().unwrap_or(Error::PrematureClose)),
            SinkState::Ended | SinkState::Destroyed => Some(Error::PrematureClose),
        })
    }

    fn observe(self: &Arc<Self>) {
        let on_error = self.clone();
        self.source.subscribe(
            SourceEventKind::Error,
            Box::new(move |event| {
                if let SourceEvent::Error(err) = event {
                    on_error.fail(err.clone());
                }
            }),
        );
        let on_close = self.clone();
        self.source.subscribe(
            SourceEventKind::Close,
            Box::new(move |_| {
                if on_close.source.state() != SourceState::Ended {
                    on_close.fail(Error::PrematureClose);
                }
            }),
        );

        for sink in &self.sinks {
            let on_error = self.clone();
            sink.subscribe(
                SinkEventKind::Error,
                Box::new(move |event| {
                    if let SinkEvent::Error(err) = event {
                        on_error.fail(err.clone());
                    }
                }),
            );
            let on_finish = self.clone();
            sink.subscribe(
                SinkEventKind::Finish,
                Box::new(move |_| {
                    if on_finish.unfinished.fetch_sub(1, Ordering::SeqCst) == 1 {
                        on_finish.complete();
                    }
                }),
            );
            let on_close = self.clone();
            let closed = sink.clone();
            sink.subscribe(
                SinkEventKind::Close,
                Box::new(move |_| {
                    if closed.state() != SinkState::Ended {
                        on_close.fail(Error::PrematureClose);
                    }
                }),
            );
        }
    }

    /// Destroy every stage with `err` and resolve the pipeline. Only the
    /// first call has any effect.
    fn fail(&self, err: Error) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        warn!(source = %self.source.id(), error = %err, "pipeline failed, destroying stages");
        self.source.destroy(Some(err.clone()));
        for sink in &self.sinks {
            sink.destroy(Some(err.clone()));
        }
        let _ = tx.send(Err(err));
    }

    fn complete(&self) {
        let Some(tx) = self.tx.lock().take() else {
            return;
        };
        debug!(source = %self.source.id(), "pipeline finished");
        let _ = tx.send(Ok(()));
    }
}
