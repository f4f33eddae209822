//! End-to-end behaviour of sources, sinks and managed pipelines

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowpipe::prelude::*;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::{sleep, Instant};

fn collector() -> (Arc<Mutex<Vec<i64>>>, impl FnMut(i64) -> std::future::Ready<Result<()>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    (seen, move |n| {
        sink_seen.lock().push(n);
        std::future::ready(Ok(()))
    })
}

#[tokio::test]
async fn pull_mode_reads_every_item_then_none() -> Result<()> {
    let source = SourceStream::from_items(1..=6i64, StreamConfig::object())?;
    let ends = Arc::new(AtomicUsize::new(0));
    let e = ends.clone();
    source.on_end(move || {
        e.fetch_add(1, Ordering::SeqCst);
    });

    let mut items = Vec::new();
    while let Some(n) = source.read_next().await? {
        items.push(n);
    }
    assert_eq!(items, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(source.read_next().await?, None);

    source.finished().await?;
    assert_eq!(source.state(), SourceState::Ended);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn managed_pipeline_into_slow_sink() -> Result<()> {
    let source = SourceStream::from_items(1..=6i64, StreamConfig::object())?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let sink = SinkStream::new(
        FnSink::new(move |n: i64| {
            let s = s.clone();
            async move {
                sleep(Duration::from_millis(50)).await;
                s.lock().push(n);
                Ok(())
            }
        }),
        StreamConfig::object(),
    )?;

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (tx, rx) = oneshot::channel();
    let started = Instant::now();
    let handle = Pipeline::new(&source, &sink).run_with(move |outcome| {
        c.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(outcome);
    });

    let outcome = rx.await?;
    handle.await.unwrap();

    assert!(outcome.is_ok());
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.state(), SinkState::Ended);
    assert_eq!(source.state(), SourceState::Ended);
    Ok(())
}

#[tokio::test]
async fn sink_signals_backpressure_and_drains_once() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let g = gate.clone();
    let sink = SinkStream::new(
        FnSink::new(move |_n: i64| {
            let g = g.clone();
            async move {
                g.acquire().await?.forget();
                Ok::<_, Error>(())
            }
        }),
        StreamConfig::object().high_water_mark(2),
    )?;

    let drains = Arc::new(AtomicUsize::new(0));
    let d = drains.clone();
    sink.on_drain(move || {
        d.fetch_add(1, Ordering::SeqCst);
    });

    assert!(sink.write(1)?);
    assert!(sink.write(2)?);
    assert!(!sink.write(3)?);
    assert!(!sink.write(4)?);
    assert_eq!(sink.state(), SinkState::Draining);
    assert_eq!(sink.buffered_size(), 4);
    assert_eq!(drains.load(Ordering::SeqCst), 0);

    gate.add_permits(4);
    sink.drained().await?;
    assert_eq!(sink.buffered_size(), 0);
    sleep(Duration::from_millis(20)).await;

    assert_eq!(drains.load(Ordering::SeqCst), 1);
    assert_eq!(sink.state(), SinkState::Writable);
    assert!(sink.write(5)?);
    assert_eq!(drains.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn sink_error_tears_down_managed_pipeline() -> Result<()> {
    let source = SourceStream::from_items(1..=6i64, StreamConfig::object().high_water_mark(1))?;
    let sink = SinkStream::new(
        FnSink::new(|n: i64| async move {
            sleep(Duration::from_millis(10)).await;
            if n == 2 {
                return Err(Error::custom("cannot store 2"));
            }
            Ok(())
        }),
        StreamConfig::object().high_water_mark(1),
    )?;

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (tx, rx) = oneshot::channel();
    let handle = Pipeline::new(&source, &sink).run_with(move |outcome| {
        c.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(outcome);
    });

    let outcome = rx.await?;
    handle.await.unwrap();

    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Consumption(_)));
    assert!(err.to_string().contains("cannot store 2"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(source.state(), SourceState::Errored);
    assert_eq!(sink.state(), SinkState::Errored);
    assert!(matches!(source.error(), Some(Error::Consumption(_))));
    Ok(())
}

#[tokio::test]
async fn source_error_tears_down_managed_pipeline() -> Result<()> {
    let mut produced = 0i64;
    let source = SourceStream::new(
        FnSource::new(move || {
            produced += 1;
            let n = produced;
            async move {
                if n > 3 {
                    Err(Error::custom("sensor offline"))
                } else {
                    Ok(Some(n))
                }
            }
        }),
        StreamConfig::object(),
    )?;
    let sink = SinkStream::new(CollectSink::new(), StreamConfig::object())?;

    let err = pipeline(&source, &sink).await.unwrap_err();
    assert!(matches!(err, Error::Production(_)));
    assert_eq!(source.state(), SourceState::Errored);
    assert_eq!(sink.state(), SinkState::Errored);
    assert!(matches!(sink.finished().await, Err(Error::Production(_))));
    Ok(())
}

#[tokio::test]
async fn ordering_survives_backpressure() -> Result<()> {
    let source = SourceStream::from_items(1..=100i64, StreamConfig::object().high_water_mark(4))?;
    let (seen, consume) = collector();
    let sink = SinkStream::new(
        FnSink::new(consume),
        StreamConfig::object().high_water_mark(2),
    )?;

    pipeline(&source, &sink).await?;
    assert_eq!(*seen.lock(), (1..=100).collect::<Vec<_>>());
    Ok(())
}

struct ExclusiveSink {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Sink for ExclusiveSink {
    type Item = i64;

    async fn write(&mut self, _item: i64) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(1)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sink_writes_never_overlap() -> Result<()> {
    let peak = Arc::new(AtomicUsize::new(0));
    let sink = SinkStream::new(
        ExclusiveSink {
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        },
        StreamConfig::object().high_water_mark(8),
    )?;

    sink.send_all(tokio_stream::iter(0..40i64)).await?;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn pipeline_fans_out_to_every_sink() -> Result<()> {
    let source = SourceStream::from_items(1..=20i64, StreamConfig::object().high_water_mark(3))?;
    let fast = CollectSink::new();
    let slow_seen = Arc::new(Mutex::new(Vec::new()));
    let s = slow_seen.clone();
    let fast_stream = SinkStream::new(fast.clone(), StreamConfig::object())?;
    let slow_stream = SinkStream::new(
        FnSink::new(move |n: i64| {
            let s = s.clone();
            async move {
                sleep(Duration::from_millis(1)).await;
                s.lock().push(n);
                Ok(())
            }
        }),
        StreamConfig::object().high_water_mark(1),
    )?;

    Pipeline::new(&source, &fast_stream)
        .tee(&slow_stream)
        .run()
        .await?;

    let expected: Vec<i64> = (1..=20).collect();
    assert_eq!(fast.items().await, expected);
    assert_eq!(*slow_seen.lock(), expected);
    Ok(())
}

#[tokio::test]
async fn destroyed_source_closes_pipeline_prematurely() -> Result<()> {
    let gate = Arc::new(Semaphore::new(0));
    let g = gate.clone();
    let source = SourceStream::from_items(1..=10i64, StreamConfig::object().high_water_mark(1))?;
    let sink = SinkStream::new(
        FnSink::new(move |_n: i64| {
            let g = g.clone();
            async move {
                g.acquire().await?.forget();
                Ok::<_, Error>(())
            }
        }),
        StreamConfig::object().high_water_mark(1),
    )?;

    let run = tokio::spawn(Pipeline::new(&source, &sink).run());
    while !source.is_paused() || sink.buffered_size() < 2 {
        tokio::task::yield_now().await;
    }
    source.destroy(None);

    let outcome = run.await.unwrap();
    assert!(matches!(outcome, Err(Error::PrematureClose)));
    assert_eq!(source.state(), SourceState::Destroyed);
    assert_eq!(sink.state(), SinkState::Errored);
    Ok(())
}

#[tokio::test]
async fn terminal_stage_fails_pipeline_immediately() -> Result<()> {
    let source = SourceStream::from_items(1..=3i64, StreamConfig::object())?;
    let sink = SinkStream::new(CollectSink::<i64>::new(), StreamConfig::object())?;
    sink.end(None)?;
    sink.finished().await?;

    let outcome = pipeline(&source, &sink).await;
    assert!(matches!(outcome, Err(Error::PrematureClose)));
    assert_eq!(source.state(), SourceState::Errored);
    assert_eq!(sink.state(), SinkState::Ended);
    Ok(())
}

#[tokio::test]
async fn byte_streams_count_bytes() -> Result<()> {
    let chunks: Vec<Vec<u8>> = (0..8).map(|i| vec![i as u8; 4096]).collect();
    let source = SourceStream::from_items(chunks.clone(), StreamConfig::default())?;
    let counter = CountSink::new();
    let sink = SinkStream::new(counter.clone(), StreamConfig::default().high_water_mark(8192))?;

    pipeline(&source, &sink).await?;
    assert_eq!(counter.count().await, 8);
    assert_eq!(counter.bytes().await, 8 * 4096);
    Ok(())
}
