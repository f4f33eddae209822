//! Ready-made producers for source streams.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::chunk::Chunk;
use crate::error::Result;
use crate::source::SourceController;
use crate::traits::Source;

/// Upper bound on chunks pushed by a single refill of an [`IterSource`]
const ITER_BATCH: usize = 64;

/// A producer that yields the items of an iterator, then ends
pub struct IterSource<I> {
    iter: I,
}

impl<I: Iterator> IterSource<I> {
    pub fn new<T>(items: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            iter: items.into_iter(),
        }
    }
}

#[async_trait]
impl<I> Source for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Chunk,
{
    type Item = I::Item;

    async fn refill(&mut self, ctl: &mut SourceController<I::Item>) -> Result<()> {
        for _ in 0..ITER_BATCH {
            match self.iter.next() {
                Some(item) => {
                    if !ctl.push(item) {
                        return Ok(());
                    }
                }
                None => {
                    ctl.end();
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// A producer backed by an async function.
///
/// Each refill awaits the function once and pushes what it returns;
/// `Ok(None)` ends the stream.
pub struct FnSource<F> {
    produce: F,
}

impl<F> FnSource<F> {
    pub fn new<Fut, T>(produce: F) -> Self
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        Self { produce }
    }
}

#[async_trait]
impl<F, Fut, T> Source for FnSource<F>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<T>>> + Send,
    T: Chunk,
{
    type Item = T;

    async fn refill(&mut self, ctl: &mut SourceController<T>) -> Result<()> {
        match (self.produce)().await? {
            Some(item) => {
                ctl.push(item);
            }
            None => ctl.end(),
        }
        Ok(())
    }
}

/// A producer that spaces out the refills of another producer
pub struct IntervalSource<S> {
    inner: S,
    interval: Duration,
    last_refill: Option<Instant>,
}

impl<S> IntervalSource<S> {
    pub fn new(inner: S, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_refill: None,
        }
    }
}

#[async_trait]
impl<S: Source> Source for IntervalSource<S> {
    type Item = S::Item;

    async fn refill(&mut self, ctl: &mut SourceController<S::Item>) -> Result<()> {
        if let Some(last) = self.last_refill {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            }
        }

        let result = self.inner.refill(ctl).await;
        self.last_refill = Some(Instant::now());
        result
    }
}
