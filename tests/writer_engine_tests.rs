//! Write engine behavior against the in-memory store: batching, failure isolation,
//! backpressure and bounded shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use promhouse::telemetry::bridge_metrics::WriterMetrics;
use promhouse::telemetry::{noop_event_listener, BridgeEvent, EventListener};
use promhouse::types::QueryRow;
use promhouse::{
    BridgeError, Label, MatchOp, Matcher, MemoryStore, Query, Reader, Sample, ShutdownOutcome,
    TimeSeries, WriteEngine, WriterConfig,
};

#[derive(Debug, Default)]
struct RecordingListener {
    events: Mutex<Vec<BridgeEvent>>,
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: BridgeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn series(name: &str, labels: &[(&str, &str)], n: usize) -> TimeSeries {
    let mut all = vec![Label::new("__name__", name)];
    all.extend(labels.iter().map(|(k, v)| Label::new(*k, *v)));
    TimeSeries {
        labels: all,
        samples: (0..n)
            .map(|i| Sample {
                timestamp_ms: 1_700_000_000_000 + i as i64 * 1000,
                value: i as f64,
            })
            .collect(),
    }
}

fn config(queue_capacity: usize, batch_size: usize) -> WriterConfig {
    WriterConfig {
        queue_capacity,
        batch_size,
        max_batch_wait: None,
    }
}

fn engine_with(
    store: &MemoryStore,
    cfg: WriterConfig,
    events: Arc<dyn EventListener>,
) -> WriteEngine {
    WriteEngine::new(Arc::new(store.clone()), cfg, WriterMetrics::default(), events)
        .expect("engine init")
}

#[test]
fn batches_are_ceil_n_over_b_and_everything_is_sent() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, config(64, 4), noop_event_listener());

    engine
        .submit(&[series("up", &[("job", "api")], 10)])
        .expect("submit");
    let outcome = engine.shutdown(Duration::from_secs(5)).expect("shutdown");
    assert_eq!(outcome, ShutdownOutcome::Clean);

    // 10 records with batch size 4: two full batches, the remainder drained on close.
    assert_eq!(store.commit_sizes(), vec![4, 4, 2]);
    let snap = engine.metrics().snapshot();
    assert_eq!(snap.received, 10);
    assert_eq!(snap.sent, 10);
    assert_eq!(snap.failed, 0);
    assert_eq!(snap.batches_committed, 3);
    assert_eq!(store.committed().len(), 10);
}

#[test]
fn records_keep_fifo_order_within_a_series() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, config(8, 3), noop_event_listener());

    engine.submit(&[series("up", &[], 20)]).expect("submit");
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");

    let ts: Vec<i64> = store.committed().iter().map(|r| r.timestamp_ms).collect();
    let mut sorted = ts.clone();
    sorted.sort_unstable();
    assert_eq!(ts, sorted);
}

#[test]
fn failed_insert_is_isolated_and_batch_still_counts_as_sent() {
    let store = MemoryStore::new();
    // Third record of the first (and only) batch.
    store.fail_insert_at(2);
    let listener = Arc::new(RecordingListener::default());
    let engine = engine_with(&store, config(16, 5), listener.clone());

    engine.submit(&[series("up", &[("job", "api")], 5)]).expect("submit");
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");

    let snap = engine.metrics().snapshot();
    assert_eq!(snap.sent, 5, "a committed batch counts in full");
    assert_eq!(snap.failed, 1);
    let stored: Vec<f64> = store.committed().iter().map(|r| r.value).collect();
    assert_eq!(stored, vec![0.0, 1.0, 3.0, 4.0]);

    let events = listener.events.lock().unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::InsertFailed { .. }))
            .count(),
        1
    );
}

#[test]
fn tags_are_sorted_before_insert_regardless_of_label_order() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, config(16, 16), noop_event_listener());

    let a = series("up", &[("zone", "eu"), ("job", "api")], 1);
    let mut b = series("up", &[("job", "api"), ("zone", "eu")], 1);
    b.labels.reverse();
    engine.submit(&[a, b]).expect("submit");
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");

    let committed = store.committed();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[0].tags, committed[1].tags);
    assert_eq!(
        committed[0].tags,
        vec!["__name__=up", "job=api", "zone=eu"]
    );
    assert_eq!(committed[0].name, "up");
}

#[test]
fn one_label_set_written_in_two_orders_reads_back_as_one_series() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, config(16, 16), noop_event_listener());

    let a = series("up", &[("zone", "eu"), ("job", "api")], 2);
    let mut b = series("up", &[("job", "api"), ("zone", "eu")], 2);
    b.labels.reverse();
    for s in &mut b.samples {
        s.timestamp_ms += 60_000;
    }
    engine.submit(&[a, b]).expect("submit");
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");

    // Replay the stored rows the way the backend would return them.
    let rows = store
        .committed()
        .into_iter()
        .map(|rec| {
            Ok(QueryRow {
                count: 1,
                timestamp_ms: rec.timestamp_secs() * 1000,
                name: rec.name,
                tags: rec.tags,
                value: rec.value,
            })
        })
        .collect();
    store.push_response(rows);

    let reader = Reader::with_store(Arc::new(store.clone())).expect("reader");
    let result = reader
        .read(&[Query {
            start_ms: 1_700_000_000_000,
            end_ms: 1_700_000_600_000,
            matchers: vec![Matcher::new("__name__", MatchOp::Eq, "up")],
        }])
        .expect("read");

    assert_eq!(result.len(), 1, "got {:?}", result);
    assert_eq!(result[0].samples.len(), 4);
    assert_eq!(
        result[0].labels,
        vec![
            Label::new("__name__", "up"),
            Label::new("job", "api"),
            Label::new("zone", "eu"),
        ]
    );
}

#[test]
fn series_without_name_label_gets_empty_name() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, config(4, 4), noop_event_listener());

    let ts = TimeSeries {
        labels: vec![Label::new("job", "api")],
        samples: vec![Sample {
            timestamp_ms: 1000,
            value: 1.0,
        }],
    };
    engine.submit(&[ts]).expect("submit");
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");

    let committed = store.committed();
    assert_eq!(committed[0].name, "");
    assert_eq!(committed[0].tags, vec!["job=api"]);
}

#[test]
fn submit_blocks_while_queue_is_full() {
    let store = MemoryStore::new();
    store.pause();
    let engine = Arc::new(engine_with(&store, config(2, 1), noop_event_listener()));

    let done = Arc::new(AtomicBool::new(false));
    let producer = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            // One record is held by the paused flush thread, two fill the queue,
            // the rest must wait.
            engine.submit(&[series("up", &[], 6)]).expect("submit");
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(200));
    assert!(
        !done.load(Ordering::SeqCst),
        "submit should block while the queue is full"
    );
    assert_eq!(engine.metrics().snapshot().received, 6);

    store.resume();
    producer.join().expect("producer");
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");
    assert_eq!(store.committed().len(), 6);
}

#[test]
fn shutdown_times_out_when_backend_stalls() {
    let store = MemoryStore::new();
    store.pause();
    let listener = Arc::new(RecordingListener::default());
    let engine = Arc::new(engine_with(&store, config(16, 1), listener.clone()));

    engine.submit(&[series("up", &[], 4)]).expect("submit");
    thread::sleep(Duration::from_millis(50));

    let outcome = engine
        .shutdown(Duration::from_millis(200))
        .expect("shutdown");
    match outcome {
        ShutdownOutcome::TimedOut { pending } => assert!(pending >= 1, "pending={}", pending),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(listener
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, BridgeEvent::ShutdownTimedOut { .. })));

    // Let the stalled thread finish so the test does not leak it.
    store.resume();
    engine.wait().expect("wait");
}

#[test]
fn submit_after_shutdown_is_rejected() {
    let store = MemoryStore::new();
    let engine = engine_with(&store, config(4, 4), noop_event_listener());
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");

    let err = engine.submit(&[series("up", &[], 1)]).unwrap_err();
    assert!(matches!(err, BridgeError::WriterClosed));
}

#[test]
fn linger_commits_partial_batches_while_open() {
    let store = MemoryStore::new();
    let cfg = WriterConfig {
        queue_capacity: 16,
        batch_size: 100,
        max_batch_wait: Some(Duration::from_millis(20)),
    };
    let engine = engine_with(&store, cfg, noop_event_listener());

    engine.submit(&[series("up", &[], 3)]).expect("submit");
    let mut waited = 0;
    while store.committed().len() < 3 && waited < 100 {
        thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
    assert_eq!(store.committed().len(), 3, "partial batch should commit before close");
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");
}

#[test]
fn concurrent_submitters_lose_nothing() {
    let store = MemoryStore::new();
    let engine = Arc::new(engine_with(&store, config(32, 7), noop_event_listener()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let job = format!("job{}", t);
                for _ in 0..5 {
                    engine
                        .submit(&[series("up", &[("job", job.as_str())], 10)])
                        .expect("submit");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("submitter");
    }
    engine.shutdown(Duration::from_secs(5)).expect("shutdown");

    let snap = engine.metrics().snapshot();
    assert_eq!(snap.received, 200);
    assert_eq!(snap.sent, 200);
    assert_eq!(store.committed().len(), 200);
}
