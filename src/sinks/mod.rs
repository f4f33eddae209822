//! Ready-made consumers for sink streams.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

use crate::chunk::Chunk;
use crate::error::Result;
use crate::traits::Sink;

/// A sink that collects chunks into a vector.
///
/// Clones share the same vector, so a clone kept outside the stream can
/// inspect what was consumed.
pub struct CollectSink<T> {
    items: Arc<TokioMutex<Vec<T>>>,
}

impl<T: Clone> CollectSink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(TokioMutex::new(Vec::new())),
        }
    }

    /// A copy of the chunks collected so far
    pub async fn items(&self) -> Vec<T> {
        self.items.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[async_trait]
impl<T: Chunk> Sink for CollectSink<T> {
    type Item = T;

    async fn write(&mut self, item: T) -> Result<()> {
        self.items.lock().await.push(item);
        Ok(())
    }
}

impl<T: Clone> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub chunks: usize,
    pub bytes: usize,
}

/// A sink that counts chunks and their sizes
pub struct CountSink<T> {
    tally: Arc<TokioMutex<Tally>>,
    _phantom: PhantomData<fn(T)>,
}

impl<T> CountSink<T> {
    pub fn new() -> Self {
        Self {
            tally: Arc::new(TokioMutex::new(Tally::default())),
            _phantom: PhantomData,
        }
    }

    pub async fn count(&self) -> usize {
        self.tally.lock().await.chunks
    }

    /// Total `byte_len` of everything consumed
    pub async fn bytes(&self) -> usize {
        self.tally.lock().await.bytes
    }

    pub async fn tally(&self) -> Tally {
        *self.tally.lock().await
    }
}

#[async_trait]
impl<T: Chunk> Sink for CountSink<T> {
    type Item = T;

    async fn write(&mut self, item: T) -> Result<()> {
        let mut tally = self.tally.lock().await;
        tally.chunks += 1;
        tally.bytes += item.byte_len();
        Ok(())
    }
}

impl<T> Default for CountSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CountSink<T> {
    fn clone(&self) -> Self {
        Self {
            tally: self.tally.clone(),
            _phantom: PhantomData,
        }
    }
}

/// A sink backed by an async function called once per chunk
pub struct FnSink<F, T> {
    consume: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> FnSink<F, T> {
    pub fn new<Fut>(consume: F) -> Self
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        Self {
            consume,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T> Sink for FnSink<F, T>
where
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
    T: Chunk,
{
    type Item = T;

    async fn write(&mut self, item: T) -> Result<()> {
        (self.consume)(item).await
    }
}
