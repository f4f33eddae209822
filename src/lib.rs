//! # Backpressure-controlled source and sink streams
//!
//! `flowpipe` pairs a chunk-producing [`SourceStream`](source::SourceStream)
//! with a chunk-consuming [`SinkStream`](sink::SinkStream). Each stream keeps
//! its own bounded queue and signals when that queue crosses its high water
//! mark, so a fast producer never runs unboundedly ahead of a slow consumer.
//!
//! ## Core Concepts
//!
//! - **Source**: produces chunks on request through [`traits::Source::refill`]
//! - **Sink**: consumes one chunk at a time through [`traits::Sink::write`]
//! - **Pipe**: forwards a source to its sinks and turns backpressure into
//!   pause/resume, without propagating errors
//! - **Pipeline**: a pipe with one aggregated outcome; the first error tears
//!   every stage down
//!
//! ## Example
//!
//! ```rust
//! use flowpipe::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let source = SourceStream::from_items(1..=100i64, StreamConfig::object())?;
//!     let collected = CollectSink::new();
//!     let sink = SinkStream::new(collected.clone(), StreamConfig::object())?;
//!
//!     pipeline(&source, &sink).await?;
//!     assert_eq!(collected.len().await, 100);
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod config;
pub mod emitter;
pub mod error;
mod metrics;
pub mod pipe;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod sinks;
pub mod source;
pub mod sources;
pub mod traits;

// Re-export commonly used items
pub mod prelude {
    pub use crate::chunk::Chunk;
    pub use crate::config::StreamConfig;
    pub use crate::emitter::ListenerId;
    pub use crate::error::{Error, ProtocolViolation, Result};
    pub use crate::pipe::{connect, Pipe, PipeOptions};
    pub use crate::pipeline::{pipeline, Pipeline};
    pub use crate::sink::{SinkEvent, SinkEventKind, SinkState, SinkStream};
    pub use crate::sinks::{CollectSink, CountSink, FnSink};
    pub use crate::source::{
        FlowMode, SourceController, SourceEvent, SourceEventKind, SourceState, SourceStream,
    };
    pub use crate::sources::{FnSource, IntervalSource, IterSource};
    pub use crate::traits::{Readable, Sink, Source, StreamId, Writable};
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
