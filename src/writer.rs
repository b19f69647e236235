//! Write engine: bounded sample queue, the background flush thread, and bounded-time shutdown.

use crate::buffer::{sample_queue, QueueReader, QueueWriter};
use crate::error::{BridgeError, Result};
use crate::storage::SampleStore;
use crate::telemetry::bridge_metrics::WriterMetrics;
use crate::telemetry::{noop_event_listener, BridgeEvent, EventListener};
use crate::types::{SampleRecord, TimeSeries};

use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long shutdown waits for the flush thread to drain before giving up on queued samples.
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Configuration options for the [`WriteEngine`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Capacity of the bounded sample queue. Submitters block when it is full.
    pub queue_capacity: usize,
    /// Maximum number of records committed in one transaction.
    pub batch_size: usize,
    /// When set, a batch is committed once this much time has passed since its first record,
    /// even if it is not full. `None` waits for a full batch or for the queue to close.
    pub max_batch_wait: Option<Duration>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            queue_capacity: 8192,
            batch_size: 8192,
            max_batch_wait: None,
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 1 {
            return Err(BridgeError::InvalidConfig(format!(
                "batch_size must be at least 1, got {}",
                self.batch_size
            )));
        }
        if self.queue_capacity < 1 {
            return Err(BridgeError::InvalidConfig(format!(
                "queue_capacity must be at least 1, got {}",
                self.queue_capacity
            )));
        }
        Ok(())
    }
}

/// How a bounded shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The flush thread drained the queue and exited.
    Clean,
    /// The deadline elapsed first; `pending` samples were still queued and are lost.
    TimedOut { pending: u64 },
}

/// Decouples bursty inbound writes from batched storage commits.
///
/// Producers call [`WriteEngine::submit`] from any thread; a single background thread draws
/// batches from the bounded queue and commits each batch in one storage transaction.
#[derive(Debug)]
pub struct WriteEngine {
    queue: QueueWriter,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    /// Signalled (or disconnected) when the flush thread exits.
    done_rx: Mutex<mpsc::Receiver<()>>,
    metrics: WriterMetrics,
    events: Arc<dyn EventListener>,
    config: WriterConfig,
}

impl WriteEngine {
    /// Creates the engine and starts its flush thread.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the thread cannot be spawned.
    pub fn new(
        store: Arc<dyn SampleStore>,
        config: WriterConfig,
        metrics: WriterMetrics,
        events: Arc<dyn EventListener>,
    ) -> Result<Self> {
        config.validate()?;

        let (queue, reader) = sample_queue(config.queue_capacity);
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let flusher = Flusher {
            store,
            reader,
            metrics: metrics.clone(),
            events: Arc::clone(&events),
            batch_size: config.batch_size,
            linger: config.max_batch_wait,
        };

        let flush_handle = thread::Builder::new()
            .name("promhouse-writer".to_string())
            .spawn(move || {
                flusher.run();
                let _ = done_tx.send(());
            })
            .map_err(|e| BridgeError::BackgroundTaskError(e.to_string()))?;

        Ok(WriteEngine {
            queue,
            flush_handle: Mutex::new(Some(flush_handle)),
            done_rx: Mutex::new(done_rx),
            metrics,
            events,
            config,
        })
    }

    /// Engine with default configuration, a default metrics handle and no event listener.
    pub fn with_store(store: Arc<dyn SampleStore>) -> Result<Self> {
        Self::new(
            store,
            WriterConfig::default(),
            WriterMetrics::default(),
            noop_event_listener(),
        )
    }

    /// Flattens every sample of every series into a record and queues it.
    ///
    /// Blocks while the queue is full; never drops samples. The received counter grows by
    /// the number of samples in each series before that series is queued.
    ///
    /// # Errors
    /// [`BridgeError::WriterClosed`] if called after [`WriteEngine::close`].
    pub fn submit(&self, batch: &[TimeSeries]) -> Result<()> {
        for series in batch {
            self.metrics.record_received(series.samples.len() as u64);
            let name = series.metric_name();
            let tags = series.tags();

            for sample in &series.samples {
                self.queue.push(SampleRecord {
                    name: name.to_string(),
                    tags: tags.clone(),
                    value: sample.value,
                    timestamp_ms: sample.timestamp_ms,
                })?;
            }
        }
        Ok(())
    }

    /// Closes the submission path. The flush thread drains what is queued and exits.
    pub fn close(&self) -> Result<()> {
        if !self.queue.is_closed() {
            self.events.on_event(BridgeEvent::WriterStopping);
        }
        self.queue.close()
    }

    /// Blocks until the flush thread has exited. Call after [`WriteEngine::close`].
    pub fn wait(&self) -> Result<()> {
        let handle = self.flush_handle.lock()?.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                self.events.on_event(BridgeEvent::WriterPanicked);
                return Err(BridgeError::BackgroundTaskError(
                    "flush thread panicked".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Closes the queue and waits for the flush thread, but never longer than `deadline`.
    ///
    /// A timeout is reported through the outcome and a `ShutdownTimedOut` event, not as an
    /// error: the caller is expected to keep shutting down.
    pub fn shutdown(&self, deadline: Duration) -> Result<ShutdownOutcome> {
        self.close()?;

        let finished = {
            let done_rx = self.done_rx.lock()?;
            match done_rx.recv_timeout(deadline) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
                Err(mpsc::RecvTimeoutError::Timeout) => false,
            }
        };

        if finished {
            self.wait()?;
            self.events.on_event(BridgeEvent::ShutdownClean);
            Ok(ShutdownOutcome::Clean)
        } else {
            let pending = self.queue.pending();
            self.events
                .on_event(BridgeEvent::ShutdownTimedOut { pending, deadline });
            Ok(ShutdownOutcome::TimedOut { pending })
        }
    }

    /// Records queued but not yet drawn by the flush thread.
    pub fn pending(&self) -> u64 {
        self.queue.pending()
    }

    pub fn metrics(&self) -> &WriterMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }
}

impl Drop for WriteEngine {
    fn drop(&mut self) {
        // Let the flush thread observe disconnection; do not block the dropping thread.
        let _ = self.queue.close();
    }
}

/// State owned by the flush thread.
struct Flusher {
    store: Arc<dyn SampleStore>,
    reader: QueueReader,
    metrics: WriterMetrics,
    events: Arc<dyn EventListener>,
    batch_size: usize,
    linger: Option<Duration>,
}

impl Flusher {
    fn run(self) {
        self.events.on_event(BridgeEvent::WriterStarted);

        let mut open = true;
        while open {
            self.metrics.record_loop_iteration();

            let drained = self.reader.drain_batch(self.batch_size, self.linger);
            open = drained.open;
            if drained.records.is_empty() {
                continue;
            }
            self.commit_batch(drained.records);
        }

        self.events.on_event(BridgeEvent::WriterStopped);
    }

    /// Commits one batch. Per-record insert failures are counted and skipped; begin and
    /// commit failures count once and drop the batch.
    fn commit_batch(&self, mut records: Vec<SampleRecord>) {
        let started = Instant::now();
        let batch_size = records.len();

        let mut tx = match self.store.begin() {
            Ok(tx) => tx,
            Err(e) => {
                self.events.on_event(BridgeEvent::BatchBeginFailed {
                    batch_size,
                    error: e.to_string(),
                });
                self.metrics.record_failed(1);
                return;
            }
        };

        for record in records.iter_mut() {
            record.sort_tags();
            if let Err(e) = tx.insert(record) {
                self.events.on_event(BridgeEvent::InsertFailed {
                    error: e.to_string(),
                });
                self.metrics.record_failed(1);
            }
        }

        match tx.commit() {
            Ok(()) => {
                // The whole batch counts as sent, including records whose insert failed.
                self.metrics
                    .record_batch_committed(batch_size as u64, started.elapsed());
            }
            Err(e) => {
                self.events.on_event(BridgeEvent::BatchCommitFailed {
                    batch_size,
                    error: e.to_string(),
                });
                self.metrics.record_failed(1);
            }
        }
    }
}
