//! One live push connection per resource URL, fanned out to named-event
//! subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cdash_core::{from_payload, DecodeReport, ProtocolError, SseFrame, SseFrameDecoder};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{next_backoff, StreamConfig};
use crate::error::TransportError;
use crate::transport::Transport;

const DIAGNOSTIC_CAPACITY: usize = 64;

pub type Handler = Box<dyn FnMut(&Value) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    Transport { url: String, error: TransportError },
    Protocol { url: String, error: ProtocolError },
}

impl Diagnostic {
    pub fn url(&self) -> &str {
        match self {
            Diagnostic::Transport { url, .. } | Diagnostic::Protocol { url, .. } => url,
        }
    }
}

struct Shared {
    state: ConnectionState,
    cancelled: bool,
    subscribers: Vec<(String, Handler)>,
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    reconnect: bool,
    max_frame_bytes: usize,
}

/// Handle to one resource stream. Clones share the same connection.
///
/// Handlers run while the handle's subscriber lock is held, so a handler must
/// not call back into the handle that invoked it.
#[derive(Clone)]
pub struct StreamHandle {
    url: String,
    shared: Arc<Mutex<Shared>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    diagnostics: broadcast::Sender<Diagnostic>,
}

impl StreamHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        lock_shared(&self.shared).state
    }

    pub fn is_closed(&self) -> bool {
        lock_shared(&self.shared).cancelled
    }

    /// Handlers for one event run in subscription order.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let mut shared = lock_shared(&self.shared);
        if shared.cancelled {
            return;
        }
        shared.subscribers.push((event.to_string(), Box::new(handler)));
    }

    /// Like `subscribe`, but hands over a typed payload. Payloads that do not
    /// fit `T` are reported on the diagnostic channel instead.
    pub fn subscribe_as<T, F>(&self, event: &str, mut handler: F)
    where
        T: DeserializeOwned,
        F: FnMut(T) + Send + 'static,
    {
        let url = self.url.clone();
        let diagnostics = self.diagnostics.clone();
        let event_name = event.to_string();
        self.subscribe(event, move |value| match from_payload::<T>(&event_name, value) {
            Ok(parsed) => handler(parsed),
            Err(error) => {
                warn!(event = "stream_payload_shape", url = %url, error = %error);
                let _ = diagnostics.send(Diagnostic::Protocol {
                    url: url.clone(),
                    error,
                });
            }
        });
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        lock_shared(&self.shared)
            .subscribers
            .iter()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// No handler runs after this returns. The connection task is aborted but
    /// may release its transport a moment later; only `StreamRegistry::open`
    /// waits for that.
    pub fn close(&self) {
        {
            let mut shared = lock_shared(&self.shared);
            if shared.cancelled {
                return;
            }
            shared.cancelled = true;
            shared.state = ConnectionState::Closed;
            shared.subscribers.clear();
        }
        if let Some(task) = self.lock_task().as_ref() {
            task.abort();
        }
        info!(event = "stream_closed", url = %self.url);
    }

    /// Closes the handle and hands back its aborted connection task.
    fn shutdown(&self) -> Option<JoinHandle<()>> {
        self.close();
        self.lock_task().take()
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Explicit per-view registry of stream handles.
pub struct StreamRegistry {
    transport: Arc<dyn Transport>,
    handles: HashMap<String, StreamHandle>,
    diagnostics: broadcast::Sender<Diagnostic>,
    options: ConnectionOptions,
}

impl StreamRegistry {
    pub fn new(transport: Arc<dyn Transport>, config: &StreamConfig) -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        Self {
            transport,
            handles: HashMap::new(),
            diagnostics,
            options: ConnectionOptions {
                reconnect: config.reconnect,
                max_frame_bytes: config.max_frame_bytes,
            },
        }
    }

    /// Opens `url`, closing any handle already registered for it first. The
    /// new connection is not attempted until the previous connection task
    /// has finished. Must be called from within a tokio runtime.
    pub fn open(&mut self, url: &str) -> StreamHandle {
        let previous = self.handles.remove(url).and_then(|previous| {
            debug!(event = "stream_replaced", url = %url);
            previous.shutdown()
        });

        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Connecting,
            cancelled: false,
            subscribers: Vec::new(),
        }));
        let connection = run_connection(
            url.to_string(),
            Arc::clone(&self.transport),
            Arc::clone(&shared),
            self.diagnostics.clone(),
            self.options,
        );
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                // Resolves once the aborted task has dropped its body stream.
                let _ = previous.await;
            }
            connection.await;
        });
        let handle = StreamHandle {
            url: url.to_string(),
            shared,
            task: Arc::new(Mutex::new(Some(task))),
            diagnostics: self.diagnostics.clone(),
        };
        self.handles.insert(url.to_string(), handle.clone());
        handle
    }

    /// Live handle for `url`. Handles closed directly are not reported.
    pub fn get(&self, url: &str) -> Option<&StreamHandle> {
        self.handles.get(url).filter(|handle| !handle.is_closed())
    }

    /// Returns false when no live handle was registered for `url`.
    pub fn close(&mut self, url: &str) -> bool {
        match self.handles.remove(url) {
            Some(handle) => {
                let live = !handle.is_closed();
                handle.close();
                live
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.close();
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.handles
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Moves the handle to `state` unless it has been closed.
fn advance(shared: &Mutex<Shared>, state: ConnectionState) -> bool {
    let mut shared = lock_shared(shared);
    if shared.cancelled {
        return false;
    }
    shared.state = state;
    true
}

async fn run_connection(
    url: String,
    transport: Arc<dyn Transport>,
    shared: Arc<Mutex<Shared>>,
    diagnostics: broadcast::Sender<Diagnostic>,
    options: ConnectionOptions,
) {
    let mut backoff = Duration::from_secs(1);
    let mut decoder = SseFrameDecoder::new(options.max_frame_bytes);

    loop {
        if !advance(&shared, ConnectionState::Connecting) {
            return;
        }

        let last_event_id = decoder.last_event_id().map(str::to_string);
        match transport.open(&url, last_event_id.as_deref()).await {
            Ok(mut body) => {
                if !advance(&shared, ConnectionState::Open) {
                    return;
                }
                info!(event = "stream_open", url = %url, resume_from = ?last_event_id);
                backoff = Duration::from_secs(1);

                let error = loop {
                    match body.next().await {
                        Some(Ok(bytes)) => {
                            let report = decoder.push_chunk(&bytes);
                            if !deliver(&url, &shared, &diagnostics, report) {
                                return;
                            }
                        }
                        Some(Err(error)) => break error,
                        None => {
                            let report = decoder.finish();
                            if !deliver(&url, &shared, &diagnostics, report) {
                                return;
                            }
                            break TransportError::Ended;
                        }
                    }
                };
                decoder.reset();
                report_transport(&url, &diagnostics, error);
            }
            Err(error) => report_transport(&url, &diagnostics, error),
        }

        if !options.reconnect {
            advance(&shared, ConnectionState::Closed);
            return;
        }
        if !advance(&shared, ConnectionState::Connecting) {
            return;
        }
        let delay = decoder
            .retry_ms()
            .map(Duration::from_millis)
            .unwrap_or(backoff);
        debug!(event = "stream_reconnect_wait", url = %url, delay_ms = delay.as_millis() as u64);
        tokio::time::sleep(delay).await;
        backoff = next_backoff(backoff);
    }
}

fn report_transport(url: &str, diagnostics: &broadcast::Sender<Diagnostic>, error: TransportError) {
    warn!(event = "stream_transport_error", url = %url, error = %error);
    let _ = diagnostics.send(Diagnostic::Transport {
        url: url.to_string(),
        error,
    });
}

/// Dispatches decoded frames. Returns false once the handle is closed.
fn deliver(
    url: &str,
    shared: &Mutex<Shared>,
    diagnostics: &broadcast::Sender<Diagnostic>,
    report: DecodeReport<SseFrame>,
) -> bool {
    for error in report.errors {
        warn!(event = "stream_decode_error", url = %url, error = %error);
        let _ = diagnostics.send(Diagnostic::Protocol {
            url: url.to_string(),
            error,
        });
    }

    for frame in report.frames {
        let payload = match frame.payload() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(event = "stream_payload_error", url = %url, stream_event = %frame.event, error = %error);
                let _ = diagnostics.send(Diagnostic::Protocol {
                    url: url.to_string(),
                    error,
                });
                continue;
            }
        };

        let mut guard = lock_shared(shared);
        if guard.cancelled {
            return false;
        }
        let mut delivered = 0usize;
        for (name, handler) in guard.subscribers.iter_mut() {
            if *name == frame.event {
                handler(&payload);
                delivered += 1;
            }
        }
        if delivered == 0 {
            debug!(event = "stream_event_unhandled", url = %url, stream_event = %frame.event);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use cdash_core::encode_event;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const URL: &str = "http://ci/api/0/builds/b1/";

    fn registry(transport: &MemoryTransport, reconnect: bool) -> StreamRegistry {
        let config = StreamConfig {
            reconnect,
            ..StreamConfig::default()
        };
        StreamRegistry::new(Arc::new(transport.clone()), &config)
    }

    fn event(name: &str, payload: Value) -> Vec<u8> {
        encode_event(name, &payload, None)
            .expect("encode")
            .into_bytes()
    }

    async fn settle<F: Fn() -> bool>(check: F) {
        timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handlers_run_in_subscription_order() {
        let transport = MemoryTransport::new();
        let mut registry = registry(&transport, false);
        let handle = registry.open(URL);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            handle.subscribe("build.update", move |payload| {
                seen.lock()
                    .expect("seen lock")
                    .push(format!("{tag}:{}", payload["id"]));
            });
        }

        timeout(Duration::from_secs(2), transport.wait_for_opens(1))
            .await
            .expect("open");
        settle(|| handle.state() == ConnectionState::Open).await;
        assert!(transport.send(URL, event("build.update", json!({"id": "b1"}))));
        assert!(transport.send(URL, event("job.update", json!({"id": "j1"}))));

        settle(|| seen.lock().expect("seen lock").len() == 2).await;
        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec!["first:\"b1\"".to_string(), "second:\"b1\"".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reopening_a_url_closes_the_previous_handle() {
        let transport = MemoryTransport::new();
        let mut registry = registry(&transport, false);
        let first = registry.open(URL);
        timeout(Duration::from_secs(2), transport.wait_for_opens(1))
            .await
            .expect("first open");

        settle(|| first.state() == ConnectionState::Open).await;

        let second = registry.open(URL);
        assert!(first.is_closed());
        assert_eq!(first.state(), ConnectionState::Closed);
        assert_eq!(registry.len(), 1);

        timeout(Duration::from_secs(2), transport.wait_for_opens(2))
            .await
            .expect("second open");
        assert_eq!(transport.opens()[1].live_before, 0);
        assert_eq!(transport.live_connections(URL), 1);
        assert!(!second.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handles_closed_directly_are_not_reported_live() {
        let transport = MemoryTransport::new();
        let mut registry = registry(&transport, false);
        let handle = registry.open(URL);
        timeout(Duration::from_secs(2), transport.wait_for_opens(1))
            .await
            .expect("open");

        handle.close();
        assert!(registry.get(URL).is_none());
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());

        let reopened = registry.open(URL);
        timeout(Duration::from_secs(2), transport.wait_for_opens(2))
            .await
            .expect("reopen");
        assert_eq!(transport.opens()[1].live_before, 0);
        assert_eq!(registry.get(URL).map(StreamHandle::url), Some(reopened.url()));
        assert!(registry.close(URL));
        assert!(!registry.close(URL));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_stops_dispatch_and_malformed_payloads_are_diagnosed() {
        let transport = MemoryTransport::new();
        let mut registry = registry(&transport, false);
        let mut diagnostics = registry.diagnostics();
        let handle = registry.open(URL);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle.subscribe("build.update", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timeout(Duration::from_secs(2), transport.wait_for_opens(1))
            .await
            .expect("open");
        settle(|| handle.state() == ConnectionState::Open).await;
        assert!(transport.send(URL, b"event: build.update\ndata: {oops\n\n".to_vec()));
        let diagnostic = timeout(Duration::from_secs(2), diagnostics.recv())
            .await
            .expect("diagnostic in time")
            .expect("diagnostic");
        assert!(matches!(
            diagnostic,
            Diagnostic::Protocol {
                error: ProtocolError::MalformedPayload { .. },
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        registry.close_all();
        assert_eq!(handle.state(), ConnectionState::Closed);
        transport.send(URL, event("build.update", json!({"id": "b1"})));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.subscriber_count("build.update"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn typed_subscription_drops_mismatched_shapes() {
        #[derive(serde::Deserialize)]
        struct Ping {
            count: u32,
        }

        let transport = MemoryTransport::new();
        let mut registry = registry(&transport, false);
        let mut diagnostics = registry.diagnostics();
        let handle = registry.open(URL);
        let total = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&total);
        handle.subscribe_as::<Ping, _>("ping", move |ping| {
            sink.fetch_add(ping.count as usize, Ordering::SeqCst);
        });

        timeout(Duration::from_secs(2), transport.wait_for_opens(1))
            .await
            .expect("open");
        settle(|| handle.state() == ConnectionState::Open).await;
        transport.send(URL, event("ping", json!({"count": "many"})));
        transport.send(URL, event("ping", json!({"count": 3})));

        settle(|| total.load(Ordering::SeqCst) == 3).await;
        let diagnostic = timeout(Duration::from_secs(2), diagnostics.recv())
            .await
            .expect("diagnostic in time")
            .expect("diagnostic");
        assert!(matches!(
            diagnostic,
            Diagnostic::Protocol {
                error: ProtocolError::UnexpectedShape { .. },
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_during_reconnect_wait_stops_everything() {
        let transport = MemoryTransport::new();
        let mut registry = registry(&transport, true);
        let mut diagnostics = registry.diagnostics();
        let handle = registry.open(URL);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle.subscribe("build.update", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timeout(Duration::from_secs(2), transport.wait_for_opens(1))
            .await
            .expect("open");
        settle(|| handle.state() == ConnectionState::Open).await;
        transport.fail(URL, TransportError::Read("reset by peer".to_string()));
        let diagnostic = timeout(Duration::from_secs(2), diagnostics.recv())
            .await
            .expect("diagnostic in time")
            .expect("diagnostic");
        assert!(matches!(diagnostic, Diagnostic::Transport { .. }));

        // The first backoff is one second; close well inside it.
        handle.close();
        assert_eq!(handle.state(), ConnectionState::Closed);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(transport.opens().len(), 1);
        assert!(!transport.send(URL, event("build.update", json!({"id": "b1"}))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_resumes_from_last_event_id() {
        let transport = MemoryTransport::new();
        let mut registry = registry(&transport, true);
        let mut diagnostics = registry.diagnostics();
        let handle = registry.open(URL);
        handle.subscribe("build.update", |_| {});

        timeout(Duration::from_secs(2), transport.wait_for_opens(1))
            .await
            .expect("open");
        settle(|| handle.state() == ConnectionState::Open).await;
        let frame = encode_event("build.update", &json!({"id": "b1"}), Some("41")).expect("encode");
        transport.send(URL, format!("retry: 10\n{frame}").into_bytes());
        transport.fail(URL, TransportError::Read("reset by peer".to_string()));

        let diagnostic = timeout(Duration::from_secs(2), diagnostics.recv())
            .await
            .expect("diagnostic in time")
            .expect("diagnostic");
        assert!(matches!(diagnostic, Diagnostic::Transport { .. }));

        timeout(Duration::from_secs(2), transport.wait_for_opens(2))
            .await
            .expect("reconnect");
        assert_eq!(transport.opens()[1].last_event_id.as_deref(), Some("41"));
        assert_eq!(handle.subscriber_count("build.update"), 1);
    }
}
