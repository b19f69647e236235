//! Prometheus remote storage daemon backed by ClickHouse.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`PROMHOUSE_*`), and CLI flags. Serves the remote write/read routes plus `/metrics`,
//! `/healthz` and `/readyz`, and runs until graceful shutdown (SIGINT/SIGTERM).

use std::convert::Infallible;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use config::{Config, Environment, File};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::graceful::GracefulShutdown;
use promhouse::remote::{decode_read_request, decode_write_request, encode_read_response};
use promhouse::telemetry::tracing_event_listener;
use promhouse::{
    ClickHouseConfig, ClickHouseStore, MemoryStore, Reader, ReaderConfig, SampleStore,
    ShutdownOutcome, WriteEngine, WriterConfig, WriterMetrics, DEFAULT_SHUTDOWN_DEADLINE,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "prometheus")]
use promhouse::telemetry::bridge_metrics::InProcessPrometheus;

// ---------- CLI ----------

/// Prometheus remote write/read bridge to ClickHouse.
#[derive(Parser, Debug)]
#[command(name = "promhoused", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `promhoused.toml` is loaded when it exists.
    #[arg(long, env = "PROMHOUSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective values, then exit.
    /// Does not contact the backend.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// HTTP listen address (e.g. 127.0.0.1:9201 or 0.0.0.0:9201).
    #[arg(long, env = "PROMHOUSE_HTTP_BIND")]
    pub http_bind: Option<String>,

    /// ClickHouse HTTP interface URL.
    #[arg(long, env = "PROMHOUSE_CLICKHOUSE_URL")]
    pub clickhouse_url: Option<String>,

    /// Storage backend: `clickhouse` or `memory`.
    #[arg(long, env = "PROMHOUSE_STORE")]
    pub store: Option<String>,

    /// Log filter directive (e.g. `info`, `promhouse=debug`). `RUST_LOG` wins when set.
    #[arg(long, env = "PROMHOUSE_LOG_LEVEL")]
    pub log_level: Option<String>,
}

// ---------- File/env config (all optional for partial config) ----------

/// ClickHouse section in config file.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ClickHouseFileConfig {
    pub url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
    pub create_table: Option<bool>,
}

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    pub http_bind: Option<String>,
    pub write_path: Option<String>,
    pub read_path: Option<String>,
    pub store: Option<String>,
    pub log_level: Option<String>,

    pub queue_capacity: Option<usize>,
    pub batch_size: Option<usize>,
    pub max_batch_wait_ms: Option<u64>,

    pub max_samples: Option<u32>,
    pub min_period_secs: Option<i64>,
    pub quantile: Option<f64>,
    pub database: Option<String>,
    pub table: Option<String>,

    pub clickhouse: Option<ClickHouseFileConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreKind {
    ClickHouse,
    Memory,
}

impl StoreKind {
    fn parse(s: &str) -> Result<Self, String> {
        match s {
            "clickhouse" => Ok(StoreKind::ClickHouse),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!(
                "invalid store {:?}: expected \"clickhouse\" or \"memory\"",
                other
            )),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StoreKind::ClickHouse => "clickhouse",
            StoreKind::Memory => "memory",
        }
    }
}

/// Everything the daemon needs, derived from config + env + CLI.
#[derive(Debug, Clone)]
struct DaemonSettings {
    http_bind: SocketAddr,
    write_path: String,
    read_path: String,
    store: StoreKind,
    log_level: String,
    writer: WriterConfig,
    reader: ReaderConfig,
    clickhouse: ClickHouseConfig,
}

/// Parse `http_bind` string to `SocketAddr`. Returns error message on failure.
fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
    s.parse::<SocketAddr>()
        .map_err(|e| format!("invalid http_bind {:?}: {}", s, e))
}

fn check_route(what: &str, path: &str) -> Result<(), String> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(format!("{} must start with '/', got {:?}", what, path))
    }
}

/// Load merged config. CLI overrides file/env.
fn load_daemon_config(cli: &Cli) -> Result<DaemonSettings, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("promhoused.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("PROMHOUSE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut writer = WriterConfig::default();
    let mut reader = ReaderConfig::default();
    let mut clickhouse = ClickHouseConfig::default();
    merge_into_configs(&mut writer, &mut reader, &mut clickhouse, &partial);

    if let Some(ref url) = cli.clickhouse_url {
        clickhouse.url = url.clone();
    }

    writer.validate().map_err(|e| e.to_string())?;
    reader.validate().map_err(|e| e.to_string())?;

    let http_bind = parse_http_bind(
        cli.http_bind
            .as_deref()
            .or(partial.http_bind.as_deref())
            .unwrap_or("0.0.0.0:9201"),
    )?;
    let store = StoreKind::parse(
        cli.store
            .as_deref()
            .or(partial.store.as_deref())
            .unwrap_or("clickhouse"),
    )?;
    let write_path = partial.write_path.unwrap_or_else(|| "/write".to_string());
    let read_path = partial.read_path.unwrap_or_else(|| "/read".to_string());
    check_route("write_path", &write_path)?;
    check_route("read_path", &read_path)?;
    if write_path == read_path {
        return Err(format!("write_path and read_path are both {:?}", write_path));
    }
    let log_level = cli
        .log_level
        .clone()
        .or(partial.log_level)
        .unwrap_or_else(|| "info".to_string());

    Ok(DaemonSettings {
        http_bind,
        write_path,
        read_path,
        store,
        log_level,
        writer,
        reader,
        clickhouse,
    })
}

/// Merge file/env partial config onto the library configs. Only overwrites fields that are `Some`.
fn merge_into_configs(
    writer: &mut WriterConfig,
    reader: &mut ReaderConfig,
    clickhouse: &mut ClickHouseConfig,
    partial: &DaemonFileConfig,
) {
    if let Some(n) = partial.queue_capacity {
        writer.queue_capacity = n;
    }
    if let Some(n) = partial.batch_size {
        writer.batch_size = n;
    }
    if let Some(ms) = partial.max_batch_wait_ms {
        writer.max_batch_wait = (ms > 0).then(|| Duration::from_millis(ms));
    }
    if let Some(n) = partial.max_samples {
        reader.max_samples = n;
    }
    if let Some(secs) = partial.min_period_secs {
        reader.min_period_secs = secs;
    }
    if let Some(q) = partial.quantile {
        reader.quantile = q;
    }
    if let Some(s) = &partial.database {
        reader.database = s.clone();
    }
    if let Some(s) = &partial.table {
        reader.table = s.clone();
    }
    clickhouse.database = reader.database.clone();
    clickhouse.table = reader.table.clone();

    if let Some(ch) = &partial.clickhouse {
        if let Some(s) = &ch.url {
            clickhouse.url = s.clone();
        }
        if ch.user.is_some() {
            clickhouse.user = ch.user.clone();
        }
        if ch.password.is_some() {
            clickhouse.password = ch.password.clone();
        }
        if let Some(secs) = ch.timeout_secs {
            clickhouse.timeout = Duration::from_secs(secs);
        }
        if let Some(b) = ch.create_table {
            clickhouse.create_table = b;
        }
    }
}

fn print_effective_config(settings: &DaemonSettings) {
    println!("http_bind={}", settings.http_bind);
    println!("write_path={}", settings.write_path);
    println!("read_path={}", settings.read_path);
    println!("store={}", settings.store.as_str());
    println!("queue_capacity={}", settings.writer.queue_capacity);
    println!("batch_size={}", settings.writer.batch_size);
    println!(
        "max_batch_wait_ms={}",
        settings
            .writer
            .max_batch_wait
            .map(|d| d.as_millis())
            .unwrap_or(0)
    );
    println!("max_samples={}", settings.reader.max_samples);
    println!("min_period_secs={}", settings.reader.min_period_secs);
    println!("quantile={}", settings.reader.quantile);
    println!("database={}", settings.reader.database);
    println!("table={}", settings.reader.table);
    println!("clickhouse_url={}", settings.clickhouse.url);
    println!("create_table={}", settings.clickhouse.create_table);
}

// ---------- HTTP server ----------

struct AppState {
    engine: Arc<WriteEngine>,
    reader: Arc<Reader>,
    store: Arc<dyn SampleStore>,
    write_path: String,
    read_path: String,
    #[cfg(feature = "prometheus")]
    prometheus: Option<InProcessPrometheus>,
}

type HttpResponse = Response<Full<Bytes>>;

fn text(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

async fn handle_write(state: Arc<AppState>, body: Bytes) -> HttpResponse {
    let engine = Arc::clone(&state.engine);
    // Decoding and submitting both block (submit applies backpressure).
    let result = tokio::task::spawn_blocking(move || {
        let series = decode_write_request(&body)?;
        engine.submit(&series)
    })
    .await;
    match result {
        Ok(Ok(())) => text(StatusCode::NO_CONTENT, Bytes::new()),
        Ok(Err(e)) => {
            warn!(target: "promhoused", error = %e, "write request rejected");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn handle_read(state: Arc<AppState>, body: Bytes) -> HttpResponse {
    let reader = Arc::clone(&state.reader);
    let result = tokio::task::spawn_blocking(move || {
        let queries = decode_read_request(&body)?;
        let series = reader.read(&queries)?;
        encode_read_response(series)
    })
    .await;
    match result {
        Ok(Ok(payload)) => {
            let mut resp = text(StatusCode::OK, payload);
            let headers = resp.headers_mut();
            headers.insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/x-protobuf"),
            );
            headers.insert(
                hyper::header::CONTENT_ENCODING,
                hyper::header::HeaderValue::from_static("snappy"),
            );
            resp
        }
        Ok(Err(e)) => {
            error!(target: "promhoused", error = %e, "read request failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn handle_ready(state: Arc<AppState>) -> HttpResponse {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.ping()).await {
        Ok(Ok(())) => text(StatusCode::OK, "ok"),
        Ok(Err(e)) => text(StatusCode::SERVICE_UNAVAILABLE, format!("not ready: {}", e)),
        Err(e) => text(StatusCode::SERVICE_UNAVAILABLE, format!("not ready: {}", e)),
    }
}

fn handle_metrics(state: &AppState) -> HttpResponse {
    #[cfg(feature = "prometheus")]
    if let Some(prom) = &state.prometheus {
        let mut resp = text(StatusCode::OK, prom.render());
        resp.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        return resp;
    }
    let _ = state;
    text(StatusCode::NOT_FOUND, "metrics exporter not enabled")
}

async fn service(
    state: Arc<AppState>,
    req: Request<hyper::body::Incoming>,
) -> Result<HttpResponse, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = if method == Method::POST && (path == state.write_path || path == state.read_path) {
        match req.into_body().collect().await {
            Ok(collected) => {
                let body = collected.to_bytes();
                if path == state.write_path {
                    handle_write(state, body).await
                } else {
                    handle_read(state, body).await
                }
            }
            Err(e) => text(StatusCode::BAD_REQUEST, e.to_string()),
        }
    } else if method == Method::GET {
        match path.as_str() {
            // Liveness: process is alive and responding.
            "/healthz" => text(StatusCode::OK, "ok"),
            // Readiness: the backend answers.
            "/readyz" => handle_ready(state).await,
            "/metrics" => handle_metrics(&state),
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    } else {
        text(StatusCode::NOT_FOUND, "not found")
    };
    Ok(resp)
}

/// Returns a future that completes when SIGINT (Ctrl+C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "promhoused", error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(target: "promhoused", error = %e, "failed to install SIGTERM handler");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Serves HTTP until a shutdown signal, then drains open connections.
///
/// The write engine is shut down by the caller after this returns, so no handler can submit
/// into a closed queue while connections drain.
async fn serve(
    state: Arc<AppState>,
    http_bind: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(http_bind)
        .await
        .map_err(|e| format!("failed to bind {}: {}", http_bind, e))?;
    info!(
        target: "promhoused",
        http = %http_bind,
        write_path = %state.write_path,
        read_path = %state.read_path,
        "promhoused running, press Ctrl+C or send SIGTERM to stop"
    );

    let server = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            Ok((stream, _addr)) = listener.accept() => {
                let io = TokioIo::new(Box::pin(stream));
                let state = Arc::clone(&state);
                let conn = server.serve_connection_with_upgrades(io, service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { service(state, req).await }
                }));
                let fut = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        warn!(target: "promhoused", error = ?e, "http connection error");
                    }
                });
            }
            _ = &mut shutdown => {
                info!(target: "promhoused", "shutdown signal received");
                break;
            }
        }
    }

    drop(listener);
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
    tokio::select! {
        _ = graceful.shutdown() => {
            info!(target: "promhoused", "all http connections closed");
        }
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            warn!(target: "promhoused", "shutdown timeout waiting for connections");
        }
    }
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<(), String> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::try_new(v),
        _ => EnvFilter::try_new(log_level),
    }
    .map_err(|e| format!("invalid log filter: {}", e))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| e.to_string())
}

fn build_store(settings: &DaemonSettings) -> Result<Arc<dyn SampleStore>, promhouse::BridgeError> {
    Ok(match settings.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::ClickHouse => Arc::new(ClickHouseStore::connect(settings.clickhouse.clone())?),
    })
}

// ---------- Main ----------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let settings = load_daemon_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        print_effective_config(&settings);
        return Ok(());
    }

    init_tracing(&settings.log_level).map_err(|e| {
        eprintln!("startup failed: {}", e);
        e
    })?;

    // The recorder must exist before the metrics handle binds its counters.
    #[cfg(feature = "prometheus")]
    let prometheus = match InProcessPrometheus::install(Duration::from_secs(5)) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(target: "promhoused", error = %e, "prometheus exporter disabled");
            None
        }
    };

    // Built before the async runtime: the blocking HTTP client must not live inside it.
    let store = build_store(&settings).map_err(|e| {
        eprintln!("startup failed: {}", e);
        e
    })?;

    let metrics = WriterMetrics::new(
        &settings.http_bind.ip().to_string(),
        settings.http_bind.port(),
    );
    let events = tracing_event_listener();
    let engine = Arc::new(WriteEngine::new(
        Arc::clone(&store),
        settings.writer.clone(),
        metrics,
        Arc::clone(&events),
    )?);
    let reader = Arc::new(Reader::new(
        Arc::clone(&store),
        settings.reader.clone(),
        events,
    )?);

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        reader,
        store,
        write_path: settings.write_path.clone(),
        read_path: settings.read_path.clone(),
        #[cfg(feature = "prometheus")]
        prometheus,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let served = runtime.block_on(serve(state, settings.http_bind));
    // Stragglers still holding the state finish on the blocking pool.
    runtime.shutdown_timeout(Duration::from_secs(5));

    info!(target: "promhoused", "draining write queue");
    match engine.shutdown(DEFAULT_SHUTDOWN_DEADLINE) {
        Ok(ShutdownOutcome::Clean) => {}
        Ok(ShutdownOutcome::TimedOut { pending }) => {
            warn!(target: "promhoused", pending, "write queue not drained before deadline");
        }
        Err(e) => error!(target: "promhoused", error = %e, "write engine shutdown failed"),
    }
    let snapshot = engine.metrics().snapshot();
    info!(
        target: "promhoused",
        received = snapshot.received,
        sent = snapshot.sent,
        failed = snapshot.failed,
        "shutdown complete"
    );

    served.map_err(|e| {
        eprintln!("startup failed: {}", e);
        e
    })
}
