use std::sync::Arc;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Callers provide an implementation that forwards these events to `tracing`
/// (see [`TracingEventListener`]), metrics, or custom sinks.
pub trait EventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: BridgeEvent);
}

/// Structured events emitted by the write engine and the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    WriterStarted,
    WriterStopping,
    WriterStopped,
    WriterPanicked,

    BatchBeginFailed { batch_size: usize, error: String },
    InsertFailed { error: String },
    BatchCommitFailed { batch_size: usize, error: String },

    ShutdownClean,
    /// The flush thread did not drain before the deadline; queued samples are lost.
    ShutdownTimedOut { pending: u64, deadline: Duration },

    QueryStarted { start_ms: i64, end_ms: i64, sql: String },
    QueryFailed { sql: String, error: String },
    RowDecodeFailed { error: String },
    MalformedTag { tag: String },
    ReadCompleted { queries: usize, rows: u64, series: usize },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: BridgeEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn EventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` under the `promhouse` target.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl EventListener for TracingEventListener {
    fn on_event(&self, event: BridgeEvent) {
        use tracing::{debug, error, info, warn};
        match event {
            BridgeEvent::WriterStarted => info!(target: "promhouse", step = "start", "writer started"),
            BridgeEvent::WriterStopping => info!(target: "promhouse", step = "stopping", "writer queue closed"),
            BridgeEvent::WriterStopped => info!(target: "promhouse", step = "stopped", "writer stopped"),
            BridgeEvent::WriterPanicked => error!(target: "promhouse", "writer flush thread panicked"),
            BridgeEvent::BatchBeginFailed { batch_size, error } => {
                error!(target: "promhouse", step = "begin", batch_size, %error, "failed to open batch transaction")
            }
            BridgeEvent::InsertFailed { error } => {
                error!(target: "promhouse", step = "exec", %error, "failed to insert sample")
            }
            BridgeEvent::BatchCommitFailed { batch_size, error } => {
                error!(target: "promhouse", step = "commit", batch_size, %error, "failed to commit batch")
            }
            BridgeEvent::ShutdownClean => info!(target: "promhouse", "writer shutdown cleanly"),
            BridgeEvent::ShutdownTimedOut { pending, deadline } => warn!(
                target: "promhouse",
                pending,
                deadline_secs = deadline.as_secs_f64(),
                "writer shutdown timed out, queued samples will be lost"
            ),
            BridgeEvent::QueryStarted { start_ms, end_ms, sql } => {
                debug!(target: "promhouse", start_ms, end_ms, %sql, "running read query")
            }
            BridgeEvent::QueryFailed { sql, error } => {
                error!(target: "promhouse", %sql, %error, "read query failed")
            }
            BridgeEvent::RowDecodeFailed { error } => {
                warn!(target: "promhouse", %error, "skipping undecodable result row")
            }
            BridgeEvent::MalformedTag { tag } => {
                warn!(target: "promhouse", %tag, "skipping tag without '=' separator")
            }
            BridgeEvent::ReadCompleted { queries, rows, series } => {
                debug!(target: "promhouse", queries, rows, series, "read completed")
            }
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn EventListener> {
    Arc::new(TracingEventListener)
}

/// Metric names, the write engine's metrics handle, and in-process Prometheus scraping.
///
/// ## Key properties
/// - Counts are kept in atomics owned by [`WriterMetrics`], so they can be read back without a
///   recorder (tests, shutdown reporting).
/// - Every update is mirrored to the `metrics` facade; emitting is a no-op until a recorder is
///   installed.
/// - Serverless scraping: callers can render Prometheus exposition text in-process.
pub mod bridge_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Counter, Histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Notes:
    // - Counters are exposed as `<name>_total` by the Prometheus exporter.
    // - Histograms are exposed as `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const RECEIVED_SAMPLES: &str = "received_samples";
    pub const SENT_SAMPLES: &str = "sent_samples";
    pub const FAILED_SAMPLES: &str = "failed_samples";
    /// Incremented once per flush-loop iteration; proves the loop is alive.
    pub const FLUSH_LOOP_CANARY: &str =
        "prometheus_remote_storage_sent_batch_duration_seconds_bucket_test";
    pub const SENT_BATCH_DURATION_SECONDS: &str = "sent_batch_duration_seconds";

    /// Point-in-time copy of the write engine counters.
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    pub struct WriterMetricsSnapshot {
        pub received: u64,
        pub sent: u64,
        pub failed: u64,
        pub loop_iterations: u64,
        pub batches_committed: u64,
        pub batch_seconds_sum: f64,
    }

    /// Thread-safe metrics handle passed into the write engine at construction.
    ///
    /// Cloning is cheap and clones share the same counters.
    #[derive(Clone)]
    pub struct WriterMetrics {
        inner: Arc<WriterMetricsInner>,
    }

    impl std::fmt::Debug for WriterMetrics {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("WriterMetrics")
                .field("snapshot", &self.snapshot())
                .finish()
        }
    }

    struct WriterMetricsInner {
        received: AtomicU64,
        sent: AtomicU64,
        failed: AtomicU64,
        loop_iterations: AtomicU64,
        batches_committed: AtomicU64,
        // f64 bits
        batch_seconds_sum: AtomicU64,

        received_counter: Counter,
        sent_counter: Counter,
        failed_counter: Counter,
        canary_counter: Counter,
        batch_duration: Histogram,
    }

    impl WriterMetrics {
        /// Creates a handle whose facade metrics carry the given `host`/`port` labels.
        pub fn new(host: &str, port: u16) -> Self {
            let host = host.to_string();
            let port = port.to_string();
            Self {
                inner: Arc::new(WriterMetricsInner {
                    received: AtomicU64::new(0),
                    sent: AtomicU64::new(0),
                    failed: AtomicU64::new(0),
                    loop_iterations: AtomicU64::new(0),
                    batches_committed: AtomicU64::new(0),
                    batch_seconds_sum: AtomicU64::new(0f64.to_bits()),
                    received_counter: ::metrics::counter!(RECEIVED_SAMPLES, "host" => host.clone(), "port" => port.clone()),
                    sent_counter: ::metrics::counter!(SENT_SAMPLES, "host" => host.clone(), "port" => port.clone()),
                    failed_counter: ::metrics::counter!(FAILED_SAMPLES, "host" => host.clone(), "port" => port.clone()),
                    canary_counter: ::metrics::counter!(FLUSH_LOOP_CANARY, "host" => host.clone(), "port" => port.clone()),
                    batch_duration: ::metrics::histogram!(SENT_BATCH_DURATION_SECONDS, "host" => host, "port" => port),
                }),
            }
        }

        #[inline]
        pub fn record_received(&self, samples: u64) {
            if samples > 0 {
                self.inner.received.fetch_add(samples, Ordering::Relaxed);
                self.inner.received_counter.increment(samples);
            }
        }

        #[inline]
        pub fn record_failed(&self, samples: u64) {
            self.inner.failed.fetch_add(samples, Ordering::Relaxed);
            self.inner.failed_counter.increment(samples);
        }

        #[inline]
        pub fn record_loop_iteration(&self) {
            self.inner.loop_iterations.fetch_add(1, Ordering::Relaxed);
            self.inner.canary_counter.increment(1);
        }

        /// A committed batch: `sent` grows by the whole batch size.
        pub fn record_batch_committed(&self, batch_size: u64, duration: Duration) {
            let secs = duration.as_secs_f64();
            self.inner.sent.fetch_add(batch_size, Ordering::Relaxed);
            self.inner.batches_committed.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.batch_seconds_sum.fetch_update(
                Ordering::Relaxed,
                Ordering::Relaxed,
                |bits| Some((f64::from_bits(bits) + secs).to_bits()),
            );
            self.inner.sent_counter.increment(batch_size);
            self.inner.batch_duration.record(secs);
        }

        pub fn snapshot(&self) -> WriterMetricsSnapshot {
            WriterMetricsSnapshot {
                received: self.inner.received.load(Ordering::Relaxed),
                sent: self.inner.sent.load(Ordering::Relaxed),
                failed: self.inner.failed.load(Ordering::Relaxed),
                loop_iterations: self.inner.loop_iterations.load(Ordering::Relaxed),
                batches_committed: self.inner.batches_committed.load(Ordering::Relaxed),
                batch_seconds_sum: f64::from_bits(
                    self.inner.batch_seconds_sum.load(Ordering::Relaxed),
                ),
            }
        }
    }

    impl Default for WriterMetrics {
        fn default() -> Self {
            Self::new("0.0.0.0", 9201)
        }
    }

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl std::fmt::Debug for InProcessPrometheus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InProcessPrometheus")
                .field("stop", &self.stop)
                .field("upkeep_thread", &self.upkeep_thread)
                .finish_non_exhaustive()
        }
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        ///
        /// Must run before any [`WriterMetrics`] is created, since facade handles bind to the
        /// recorder that is installed at creation time.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("promhouse-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    pub fn describe_all() {
        describe_counter!(
            RECEIVED_SAMPLES,
            Unit::Count,
            "Total number of received samples."
        );
        describe_counter!(
            SENT_SAMPLES,
            Unit::Count,
            "Total number of processed samples sent to remote storage."
        );
        describe_counter!(
            FAILED_SAMPLES,
            Unit::Count,
            "Total number of processed samples which failed on send to remote storage."
        );
        describe_counter!(
            FLUSH_LOOP_CANARY,
            Unit::Count,
            "Test metric to ensure backfilled metrics are readable via prometheus."
        );
        describe_histogram!(
            SENT_BATCH_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of sample batch send calls to the remote storage."
        );
    }
}
