//! Bounded chunk queue with running size accounting.
//!
//! The threshold is soft: [`ChunkQueue::enqueue`] reports when the aggregate
//! size has gone past it but never refuses a chunk. Callers decide what to do
//! with the signal.

use std::collections::VecDeque;

use crate::chunk::Chunk;
use crate::config::StreamConfig;

/// FIFO store of chunks sized against a high water mark.
#[derive(Debug)]
pub struct ChunkQueue<T> {
    chunks: VecDeque<(T, usize)>,
    /// Sum of queued and in-flight chunk sizes
    size: usize,
    high_water_mark: usize,
    object_mode: bool,
}

impl<T: Chunk> ChunkQueue<T> {
    /// Create an empty queue
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            high_water_mark: config.high_water_mark,
            object_mode: config.object_mode,
        }
    }

    /// Append a chunk. Returns `true` if the aggregate size now exceeds the
    /// high water mark.
    pub fn enqueue(&mut self, chunk: T) -> bool {
        let size = self.measure(&chunk);
        self.size += size;
        self.chunks.push_back((chunk, size));
        self.is_over()
    }

    /// Put a chunk back at the head of the queue.
    pub fn requeue(&mut self, chunk: T) {
        let size = self.measure(&chunk);
        self.size += size;
        self.chunks.push_front((chunk, size));
    }

    /// Remove and return the oldest chunk.
    pub fn dequeue(&mut self) -> Option<T> {
        let (chunk, size) = self.chunks.pop_front()?;
        self.size -= size;
        Some(chunk)
    }

    /// Remove the oldest chunk while keeping its size accounted until
    /// [`settle`](Self::settle) is called with the returned size.
    pub fn take_in_flight(&mut self) -> Option<(T, usize)> {
        self.chunks.pop_front()
    }

    /// Release the size of a chunk previously taken with
    /// [`take_in_flight`](Self::take_in_flight).
    pub fn settle(&mut self, size: usize) {
        debug_assert!(size <= self.size);
        self.size = self.size.saturating_sub(size);
    }

    /// Aggregate size of all chunks, including any in flight
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunk is waiting in the queue
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether the aggregate size exceeds the high water mark
    pub fn is_over(&self) -> bool {
        self.size > self.high_water_mark
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    fn measure(&self, chunk: &T) -> usize {
        if self.object_mode {
            1
        } else {
            chunk.byte_len()
        }
    }
}
