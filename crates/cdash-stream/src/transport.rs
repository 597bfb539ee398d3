use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::mpsc;

use crate::error::TransportError;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Opens one push connection and yields its raw body bytes.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        url: &str,
        last_event_id: Option<&str>,
    ) -> BoxFuture<'static, Result<ByteStream, TransportError>>;
}

/// `text/event-stream` over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn open(
        &self,
        url: &str,
        last_event_id: Option<&str>,
    ) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
        let client = self.client.clone();
        let url = cache_busted(url, Utc::now().timestamp_millis());
        let last_event_id = last_event_id.map(str::to_string);
        async move {
            let mut request = client
                .get(&url)
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache");
            if let Some(id) = last_event_id {
                request = request.header("Last-Event-ID", id);
            }
            let response = request
                .send()
                .await
                .map_err(|err| TransportError::Connect {
                    url: url.clone(),
                    message: err.to_string(),
                })?;
            if !response.status().is_success() {
                return Err(TransportError::Status {
                    url,
                    status: response.status().as_u16(),
                });
            }
            let body = response.bytes_stream().map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|err| TransportError::Read(err.to_string()))
            });
            Ok(body.boxed())
        }
        .boxed()
    }
}

/// Appends the `_=<epoch-ms>` cache-busting query parameter.
pub fn cache_busted(url: &str, epoch_ms: i64) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}_={epoch_ms}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRecord {
    pub url: String,
    pub last_event_id: Option<String>,
    /// Connections for the same URL still being read when this one opened.
    pub live_before: usize,
}

struct MemoryConnection {
    record: OpenRecord,
    sender: mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
}

#[derive(Default)]
struct MemoryState {
    connections: Vec<MemoryConnection>,
    refusing: bool,
}

/// In-process transport: every `open` creates a channel the caller feeds by
/// hand. Used by tests and demos.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, `open` fails with `TransportError::Connect`.
    pub fn set_refusing(&self, refusing: bool) {
        self.lock().refusing = refusing;
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.lock()
            .connections
            .iter()
            .map(|connection| connection.record.clone())
            .collect()
    }

    /// Connections for `url` whose reading side is still alive.
    pub fn live_connections(&self, url: &str) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|connection| connection.record.url == url && !connection.sender.is_closed())
            .count()
    }

    /// Feeds bytes to the newest live connection for `url`.
    pub fn send(&self, url: &str, bytes: impl Into<Vec<u8>>) -> bool {
        self.push(url, Ok(bytes.into()))
    }

    pub fn fail(&self, url: &str, error: TransportError) -> bool {
        self.push(url, Err(error))
    }

    /// Ends the body of every connection for `url`.
    pub fn hang_up(&self, url: &str) {
        self.lock()
            .connections
            .retain(|connection| connection.record.url != url);
    }

    pub async fn wait_for_opens(&self, count: usize) {
        loop {
            let opened = self.lock().connections.len();
            if opened >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn push(&self, url: &str, item: Result<Vec<u8>, TransportError>) -> bool {
        let state = self.lock();
        state
            .connections
            .iter()
            .rev()
            .find(|connection| connection.record.url == url && !connection.sender.is_closed())
            .map(|connection| connection.sender.send(item).is_ok())
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        url: &str,
        last_event_id: Option<&str>,
    ) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
        let mut state = self.lock();
        if state.refusing {
            let error = TransportError::Connect {
                url: url.to_string(),
                message: "connection refused".to_string(),
            };
            return async move { Err(error) }.boxed();
        }

        let live_before = state
            .connections
            .iter()
            .filter(|connection| connection.record.url == url && !connection.sender.is_closed())
            .count();
        let (sender, receiver) = mpsc::unbounded_channel();
        state.connections.push(MemoryConnection {
            record: OpenRecord {
                url: url.to_string(),
                last_event_id: last_event_id.map(str::to_string),
                live_before,
            },
            sender,
        });
        let body = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        async move { Ok(body.boxed()) }.boxed()
    }
}
