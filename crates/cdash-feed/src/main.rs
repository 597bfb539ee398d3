mod sim;

use std::convert::Infallible;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cdash_stream::parse_bool_flag;
use chrono::Utc;
use clap::Parser;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::sim::{Collection, FeedEvent, Simulation};

const EVENT_BACKLOG: usize = 1024;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    tick: Duration,
    ticks_per_run: u32,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "cdash-feed")]
#[command(about = "Development push server emitting synthetic CI events", long_about = None)]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// Milliseconds between simulation steps
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,
    /// Steps a run spends in progress before finishing
    #[arg(long, default_value_t = 20)]
    ticks_per_run: u32,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

struct FeedState {
    sim: Mutex<Simulation>,
    events: broadcast::Sender<(u64, FeedEvent)>,
    next_seq: AtomicU64,
}

impl FeedState {
    fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        Self {
            sim: Mutex::new(Simulation::new(
                config.ticks_per_run,
                config.tick.as_millis() as u64,
            )),
            events,
            next_seq: AtomicU64::new(1),
        }
    }

    fn sim(&self) -> std::sync::MutexGuard<'_, Simulation> {
        self.sim.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: FeedEvent) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!(
            event = "feed_publish",
            seq,
            stream_event = event.event,
            resource = %event.resource_id
        );
        let _ = self.events.send((seq, event));
    }

    fn start_ticker(self: Arc<Self>, period: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let events = self.sim().step(Utc::now());
                for event in events {
                    self.publish(event);
                }
            }
        });
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let state = Arc::new(FeedState::new(&config));
    state.clone().start_ticker(config.tick);

    let app = Router::new()
        .route("/api/0/builds/:id/", get(build_stream))
        .route("/api/0/jobs/:id/", get(job_stream))
        .route("/api/0/builds/:id/retry/", post(retry_build))
        .route("/api/0/jobs/:id/retry/", post(retry_job))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "feed_error", error = %err);
            return;
        }
    };

    info!(event = "feed_start", addr = %config.addr, tick_ms = config.tick.as_millis() as u64);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "feed_error", error = %err);
    }
}

async fn build_stream(
    Path(id): Path<String>,
    State(state): State<Arc<FeedState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    resource_stream(state, Collection::Builds, id)
}

async fn job_stream(
    Path(id): Path<String>,
    State(state): State<Arc<FeedState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    resource_stream(state, Collection::Jobs, id)
}

fn resource_stream(
    state: Arc<FeedState>,
    collection: Collection,
    id: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let record = state.sim().track(collection, &id, Utc::now());
    info!(event = "feed_subscribe", collection = collection.as_str(), id = %id);

    let receiver = state.events.subscribe();
    let snapshot = to_event(
        0,
        &FeedEvent {
            collection,
            resource_id: id.clone(),
            event: match collection {
                Collection::Builds => cdash_core::BUILD_UPDATE,
                Collection::Jobs => cdash_core::JOB_UPDATE,
            },
            payload: serde_json::to_value(&record).unwrap_or_default(),
        },
    );

    let live = stream::unfold(receiver, move |mut receiver| {
        let id = id.clone();
        async move {
            loop {
                match receiver.recv().await {
                    Ok((seq, event)) => {
                        if event.collection == collection && event.resource_id == id {
                            return Some((Ok(to_event(seq, &event)), receiver));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "feed_subscriber_lagged", id = %id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    });

    Sse::new(stream::once(async move { Ok(snapshot) }).chain(live))
        .keep_alive(KeepAlive::default())
}

fn to_event(seq: u64, event: &FeedEvent) -> Event {
    Event::default()
        .event(event.event)
        .id(seq.to_string())
        .data(event.payload.to_string())
}

async fn retry_build(Path(id): Path<String>, State(state): State<Arc<FeedState>>) -> Response {
    retry(state, Collection::Builds, id)
}

async fn retry_job(Path(id): Path<String>, State(state): State<Arc<FeedState>>) -> Response {
    retry(state, Collection::Jobs, id)
}

fn retry(state: Arc<FeedState>, collection: Collection, id: String) -> Response {
    let retried = state.sim().retry(collection, &id, Utc::now());
    match retried {
        Some(record) => {
            info!(event = "feed_retry", collection = collection.as_str(), id = %id, new_id = %record.id);
            Json(json!({ "build": record })).into_response()
        }
        None => {
            warn!(event = "feed_retry_unknown", collection = collection.as_str(), id = %id);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        tick: Duration::from_millis(args.tick_ms.max(10)),
        ticks_per_run: args.ticks_per_run,
        debug: args.debug
            || std::env::var("CDASH_FEED_DEBUG")
                .ok()
                .and_then(|value| parse_bool_flag(&value))
                .unwrap_or(false),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("CDASH_FEED_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "127.0.0.1:5000".to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    std::env::var("CDASH_LOG_DIR").unwrap_or_default()
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CDASH_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Mirrors log output to stdout and the optional log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("cdash-feed-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
