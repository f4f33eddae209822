//! Unmanaged connections between sources and sinks

use std::sync::Arc;
use std::time::Duration;

use flowpipe::pipe;
use flowpipe::prelude::*;
use tokio::sync::Semaphore;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn gated(gate: &Arc<Semaphore>, collected: &CollectSink<i64>) -> Result<SinkStream<i64>> {
    let gate = gate.clone();
    let collected = collected.clone();
    SinkStream::new(
        FnSink::new(move |n: i64| {
            let gate = gate.clone();
            let mut collected = collected.clone();
            async move {
                gate.acquire().await?.forget();
                collected.write(n).await
            }
        }),
        StreamConfig::object().high_water_mark(1),
    )
}

#[tokio::test]
async fn pipe_moves_everything_and_ends_the_sink() -> Result<()> {
    let source = SourceStream::from_items(1..=30i64, StreamConfig::object().high_water_mark(2))?;
    let collected = CollectSink::new();
    let sink = SinkStream::new(collected.clone(), StreamConfig::object().high_water_mark(2))?;

    let pipe = source.pipe(&sink);
    assert_eq!(pipe.sink_count(), 1);

    sink.finished().await?;
    assert_eq!(collected.items().await, (1..=30).collect::<Vec<_>>());
    assert_eq!(source.state(), SourceState::Ended);
    wait_until(|| !pipe.is_active()).await;
    Ok(())
}

#[tokio::test]
async fn pipe_without_end_leaves_sink_open() -> Result<()> {
    let source = SourceStream::from_items(1..=3i64, StreamConfig::object())?;
    let collected = CollectSink::new();
    let sink = SinkStream::new(collected.clone(), StreamConfig::object())?;

    Pipe::with_options(&source, &sink, PipeOptions::default().end(false));
    source.finished().await?;

    wait_until(|| sink.buffered_size() == 0).await;
    assert_eq!(collected.items().await, vec![1, 2, 3]);
    assert_eq!(sink.state(), SinkState::Writable);
    assert!(!sink.is_ending());
    Ok(())
}

#[tokio::test]
async fn backpressure_pauses_then_drain_resumes() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let collected = CollectSink::new();
    let source = SourceStream::from_items(1..=6i64, StreamConfig::object())?;
    let sink = gated(&gate, &collected)?;

    let _pipe = pipe::connect(&source, &sink);
    wait_until(|| source.is_paused() && sink.buffered_size() == 2).await;

    gate.add_permits(6);
    sink.finished().await?;
    assert_eq!(collected.items().await, vec![1, 2, 3, 4, 5, 6]);
    Ok(())
}

#[tokio::test]
async fn disconnect_and_reconnect_continue_without_replay() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let first = CollectSink::new();
    let source = SourceStream::from_items(1..=6i64, StreamConfig::object())?;
    let a = gated(&gate, &first)?;

    let connection = pipe::connect(&source, &a);
    wait_until(|| source.is_paused() && a.buffered_size() == 2).await;

    assert!(pipe::disconnect(&connection, &a));
    assert!(!connection.is_connected(&a));
    assert!(!connection.is_active());
    assert!(source.is_paused());
    assert_eq!(source.state(), SourceState::Active);

    let second = CollectSink::new();
    let b = SinkStream::new(second.clone(), StreamConfig::object())?;
    let _pipe = source.pipe(&b);
    b.finished().await?;
    assert_eq!(second.items().await, vec![3, 4, 5, 6]);

    gate.add_permits(2);
    wait_until(|| a.buffered_size() == 0).await;
    assert_eq!(first.items().await, vec![1, 2]);
    assert_eq!(a.state(), SinkState::Writable);
    assert!(!a.is_ending());
    Ok(())
}

#[tokio::test]
async fn sink_error_detaches_without_touching_source() -> Result<()> {
    let source = SourceStream::from_items(1..=10i64, StreamConfig::object().high_water_mark(2))?;
    let sink = SinkStream::new(
        FnSink::new(|n: i64| async move {
            if n == 2 {
                Err(Error::custom("rejected"))
            } else {
                Ok(())
            }
        }),
        StreamConfig::object().high_water_mark(1),
    )?;

    let pipe = source.pipe(&sink);
    assert!(matches!(sink.finished().await, Err(Error::Consumption(_))));

    wait_until(|| pipe.sink_count() == 0).await;
    assert_eq!(source.state(), SourceState::Active);
    assert!(source.is_paused());
    assert!(source.error().is_none());
    Ok(())
}

#[tokio::test]
async fn source_error_leaves_sink_open() -> Result<()> {
    let mut produced = 0i64;
    let source = SourceStream::new(
        FnSource::new(move || {
            produced += 1;
            let n = produced;
            async move {
                if n > 2 {
                    Err(Error::custom("upstream gone"))
                } else {
                    Ok(Some(n))
                }
            }
        }),
        StreamConfig::object(),
    )?;
    let collected = CollectSink::new();
    let sink = SinkStream::new(collected.clone(), StreamConfig::object())?;

    let pipe = source.pipe(&sink);
    assert!(matches!(source.finished().await, Err(Error::Production(_))));

    wait_until(|| !pipe.is_active()).await;
    wait_until(|| sink.buffered_size() == 0).await;
    assert_eq!(collected.items().await, vec![1, 2]);
    assert_eq!(sink.state(), SinkState::Writable);
    assert!(!sink.is_ending());
    Ok(())
}

#[tokio::test]
async fn attached_sinks_all_receive_every_chunk() -> Result<()> {
    let source = SourceStream::from_items(1..=12i64, StreamConfig::object().high_water_mark(2))?;
    let gate = Arc::new(Semaphore::new(0));
    let slow = CollectSink::new();
    let fast = CollectSink::new();
    let slow_sink = gated(&gate, &slow)?;
    let fast_sink = SinkStream::new(fast.clone(), StreamConfig::object())?;

    let pipe = source.pipe(&slow_sink);
    assert!(pipe.attach(&fast_sink));
    assert!(!pipe.attach(&fast_sink));
    assert_eq!(pipe.sink_count(), 2);

    // The slow sink holds the source back for both.
    wait_until(|| {
        source.is_paused() && slow_sink.buffered_size() == 2 && fast_sink.buffered_size() == 0
    })
    .await;
    assert_eq!(fast.items().await, vec![1, 2]);

    gate.add_permits(12);
    slow_sink.finished().await?;
    fast_sink.finished().await?;
    let expected: Vec<i64> = (1..=12).collect();
    assert_eq!(slow.items().await, expected);
    assert_eq!(fast.items().await, expected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_mid_stream_loses_nothing() -> Result<()> {
    const TOTAL: i64 = 20_000;
    let mut next = 0i64;
    let source = SourceStream::new(
        FnSource::new(move || {
            next += 1;
            let n = next;
            async move {
                if n % 64 == 0 {
                    tokio::task::yield_now().await;
                }
                Ok((n <= TOTAL).then_some(n))
            }
        }),
        StreamConfig::object(),
    )?;
    let first = CollectSink::new();
    let second = CollectSink::new();
    let roomy = StreamConfig::object().high_water_mark(1_000_000);
    let a = SinkStream::new(first.clone(), roomy)?;
    let b = SinkStream::new(second.clone(), roomy)?;
    let options = PipeOptions::default().end(false);

    let connection = Pipe::with_options(&source, &a, options);
    while first.len().await < 2_000 {
        tokio::task::yield_now().await;
    }
    connection.disconnect(&a);
    let _pipe = Pipe::with_options(&source, &b, options);

    tokio::time::timeout(Duration::from_secs(10), source.finished())
        .await
        .expect("source did not end")?;
    wait_until(|| a.buffered_size() == 0 && b.buffered_size() == 0).await;

    let mut delivered = first.items().await;
    delivered.extend(second.items().await);
    assert_eq!(delivered, (1..=TOTAL).collect::<Vec<_>>());
    Ok(())
}
