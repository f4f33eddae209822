//! Counters exported through the `metrics` facade when the `metrics` feature
//! is enabled. Without the feature every recorder compiles to nothing.

#[cfg(feature = "metrics")]
use ::metrics::counter;

pub(crate) fn chunk_produced() {
    #[cfg(feature = "metrics")]
    counter!("flowpipe_chunks_produced_total").increment(1);
}

pub(crate) fn chunk_consumed() {
    #[cfg(feature = "metrics")]
    counter!("flowpipe_chunks_consumed_total").increment(1);
}

pub(crate) fn backpressure() {
    #[cfg(feature = "metrics")]
    counter!("flowpipe_backpressure_signals_total").increment(1);
}

pub(crate) fn drained() {
    #[cfg(feature = "metrics")]
    counter!("flowpipe_drains_total").increment(1);
}

pub(crate) fn stream_error(role: &'static str) {
    #[cfg(feature = "metrics")]
    counter!("flowpipe_stream_errors_total", "role" => role).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = role;
}
