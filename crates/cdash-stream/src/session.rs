//! Details view controller for a single build or job.
//!
//! The session owns the stream registry and all view state. Stream handlers
//! only reconcile state and queue `ViewChange`s; rendering happens wherever
//! the receiver is drained.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cdash_core::{
    FilteredCollection, Ingest, LogBuffer, LogChunk, LogDelta, RecordCollection, Run, RunUpdate,
    TestRecord, TestUpdate, BUILD_LOG_UPDATE, BUILD_UPDATE, JOB_UPDATE, TEST_GROUP_UPDATE,
    TEST_UPDATE,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{Navigation, RetryAction};
use crate::config::StreamConfig;
use crate::error::ActionError;
use crate::multiplexer::{Diagnostic, StreamRegistry};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Build,
    Job,
}

impl ResourceKind {
    pub fn collection(self) -> &'static str {
        match self {
            ResourceKind::Build => "builds",
            ResourceKind::Job => "jobs",
        }
    }

    pub fn update_event(self) -> &'static str {
        match self {
            ResourceKind::Build => BUILD_UPDATE,
            ResourceKind::Job => JOB_UPDATE,
        }
    }

    pub fn noun(self) -> &'static str {
        match self {
            ResourceKind::Build => "build",
            ResourceKind::Job => "job",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.noun())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Pending,
    NoResults,
    HasResults,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::NoResults => "no-results",
            TestStatus::HasResults => "has-results",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}

/// State change for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    Record(Run),
    TestStatus(TestStatus),
    TestGroup {
        record: TestRecord,
        inserted: bool,
        position: usize,
    },
    TestFailure {
        record: TestRecord,
        inserted: bool,
        position: usize,
    },
    Log {
        source_id: String,
        delta: LogDelta,
    },
    Progress(u8),
    Notification(Notification),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSourceInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Initial state handed in by whoever fetched the snapshot.
#[derive(Debug, Clone)]
pub struct SessionBootstrap {
    pub kind: ResourceKind,
    pub record: Run,
    pub test_groups: Vec<TestRecord>,
    pub test_failures: Vec<TestRecord>,
    /// Sources the view displays. Empty means every source.
    pub log_sources: Vec<LogSourceInfo>,
    pub log_history: Vec<LogChunk>,
}

impl SessionBootstrap {
    pub fn new(kind: ResourceKind, record: Run) -> Self {
        Self {
            kind,
            record,
            test_groups: Vec::new(),
            test_failures: Vec::new(),
            log_sources: Vec::new(),
            log_history: Vec::new(),
        }
    }
}

struct ViewState {
    primary_id: String,
    records: RecordCollection<Run>,
    test_groups: RecordCollection<TestRecord>,
    test_failures: FilteredCollection<TestRecord>,
    logs: LogBuffer,
    log_filter: Option<HashSet<String>>,
    test_status: TestStatus,
    progress: u8,
    changes: mpsc::UnboundedSender<ViewChange>,
}

impl ViewState {
    fn emit(&self, change: ViewChange) {
        let _ = self.changes.send(change);
    }

    fn primary(&self) -> Option<&Run> {
        self.records.get(&self.primary_id)
    }

    fn derive_test_status(&self) -> TestStatus {
        match self.primary() {
            Some(record) if record.status.is_finished() => {
                if self.test_groups.is_empty() {
                    TestStatus::NoResults
                } else {
                    TestStatus::HasResults
                }
            }
            _ => TestStatus::Pending,
        }
    }

    fn refresh_test_status(&mut self) {
        let status = self.derive_test_status();
        if status != self.test_status {
            self.test_status = status;
            self.emit(ViewChange::TestStatus(status));
        }
    }

    fn refresh_progress(&mut self) {
        let Some(progress) = self.primary().map(|record| record.progress_at(Utc::now())) else {
            return;
        };
        if progress != self.progress {
            self.progress = progress;
            self.emit(ViewChange::Progress(progress));
        }
    }

    fn apply_record(&mut self, update: &RunUpdate) {
        if update.id != self.primary_id {
            debug!(event = "record_update_ignored", id = %update.id, primary = %self.primary_id);
            return;
        }
        let outcome = self.records.reconcile(update);
        if !outcome.changed {
            return;
        }
        let record = outcome.item.clone();
        self.emit(ViewChange::Record(record));
        self.refresh_test_status();
        self.refresh_progress();
    }

    fn apply_test_group(&mut self, update: &TestUpdate) {
        let outcome = self.test_groups.reconcile(update);
        if outcome.changed {
            let change = ViewChange::TestGroup {
                record: outcome.item.clone(),
                inserted: outcome.inserted,
                position: outcome.position,
            };
            self.emit(change);
            self.refresh_test_status();
        }
        self.apply_test_failure(update);
    }

    fn apply_test_failure(&mut self, update: &TestUpdate) {
        let change = match self.test_failures.reconcile(update) {
            Some(outcome) if outcome.changed => ViewChange::TestFailure {
                record: outcome.item.clone(),
                inserted: outcome.inserted,
                position: outcome.position,
            },
            _ => return,
        };
        self.emit(change);
    }

    fn apply_log(&mut self, chunk: &LogChunk) {
        if let Some(filter) = &self.log_filter {
            if !filter.contains(chunk.source_id()) {
                debug!(event = "log_chunk_filtered", source = %chunk.source_id());
                return;
            }
        }
        match self.logs.ingest(chunk) {
            Ingest::Accepted(delta) => {
                if delta.is_empty() {
                    return;
                }
                self.emit(ViewChange::Log {
                    source_id: chunk.source_id().to_string(),
                    delta,
                });
            }
            Ingest::Rejected { next_offset } => {
                debug!(
                    event = "log_chunk_stale",
                    source = %chunk.source_id(),
                    offset = chunk.offset,
                    next_offset
                );
            }
        }
    }
}

fn lock_view(state: &Mutex<ViewState>) -> MutexGuard<'_, ViewState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DetailsSession {
    kind: ResourceKind,
    id: String,
    url: String,
    registry: StreamRegistry,
    state: Arc<Mutex<ViewState>>,
    ticker: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl DetailsSession {
    /// Seeds view state, opens the resource stream, and starts the progress
    /// ticker. Must be called from within a tokio runtime.
    pub fn start(
        bootstrap: SessionBootstrap,
        transport: Arc<dyn Transport>,
        config: &StreamConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ViewChange>) {
        let (changes, receiver) = mpsc::unbounded_channel();
        let kind = bootstrap.kind;
        let id = bootstrap.record.id.clone();
        let url = config.resource_url(kind.collection(), &id);

        let log_filter = if bootstrap.log_sources.is_empty() {
            None
        } else {
            Some(
                bootstrap
                    .log_sources
                    .iter()
                    .map(|source| source.id.clone())
                    .collect(),
            )
        };
        let mut view = ViewState {
            primary_id: id.clone(),
            records: RecordCollection::from_snapshot([bootstrap.record]),
            test_groups: RecordCollection::from_snapshot(bootstrap.test_groups),
            test_failures: FilteredCollection::from_snapshot(
                TestUpdate::is_failed,
                bootstrap.test_failures,
            ),
            logs: LogBuffer::new(config.log_buffer_chars),
            log_filter,
            test_status: TestStatus::Pending,
            progress: 0,
            changes,
        };
        view.test_status = view.derive_test_status();
        view.emit(ViewChange::TestStatus(view.test_status));
        view.progress = view
            .primary()
            .map(|record| record.progress_at(Utc::now()))
            .unwrap_or(0);
        view.emit(ViewChange::Progress(view.progress));
        for chunk in &bootstrap.log_history {
            view.apply_log(chunk);
        }

        let state = Arc::new(Mutex::new(view));
        let mut registry = StreamRegistry::new(transport, config);
        let handle = registry.open(&url);

        let record_state = Arc::clone(&state);
        handle.subscribe_as::<RunUpdate, _>(kind.update_event(), move |update| {
            lock_view(&record_state).apply_record(&update);
        });
        let log_state = Arc::clone(&state);
        handle.subscribe_as::<LogChunk, _>(BUILD_LOG_UPDATE, move |chunk| {
            lock_view(&log_state).apply_log(&chunk);
        });
        let group_state = Arc::clone(&state);
        handle.subscribe_as::<TestUpdate, _>(TEST_GROUP_UPDATE, move |update| {
            lock_view(&group_state).apply_test_group(&update);
        });
        let test_state = Arc::clone(&state);
        handle.subscribe_as::<TestUpdate, _>(TEST_UPDATE, move |update| {
            lock_view(&test_state).apply_test_failure(&update);
        });

        let ticker = spawn_progress_ticker(Arc::clone(&state), config.progress_tick);
        info!(event = "session_started", kind = %kind, id = %id, url = %url);

        (
            Self {
                kind,
                id,
                url,
                registry,
                state,
                ticker: Some(ticker),
                torn_down: false,
            },
            receiver,
        )
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.registry.diagnostics()
    }

    pub fn record(&self) -> Option<Run> {
        lock_view(&self.state).primary().cloned()
    }

    pub fn test_status(&self) -> TestStatus {
        lock_view(&self.state).test_status
    }

    pub fn progress(&self) -> u8 {
        lock_view(&self.state).progress
    }

    pub fn test_groups(&self) -> Vec<TestRecord> {
        lock_view(&self.state).test_groups.iter().cloned().collect()
    }

    pub fn test_failures(&self) -> Vec<TestRecord> {
        lock_view(&self.state)
            .test_failures
            .records()
            .iter()
            .cloned()
            .collect()
    }

    pub fn log_text(&self, source_id: &str) -> Option<String> {
        lock_view(&self.state)
            .logs
            .source(source_id)
            .map(|source| source.text().to_string())
    }

    /// Starts accepting chunks for `source_id` when the view filters sources.
    pub fn show_log_source(&self, source_id: &str) {
        let mut view = lock_view(&self.state);
        if let Some(filter) = view.log_filter.as_mut() {
            filter.insert(source_id.to_string());
        }
    }

    pub fn notify(&self, notification: Notification) {
        lock_view(&self.state).emit(ViewChange::Notification(notification));
    }

    /// Retries this build or job. Failures surface as an error notification.
    pub async fn retry(&self, action: &RetryAction) -> Result<Navigation, ActionError> {
        let outcome = action.retry(self.kind, &self.id).await;
        self.report_retry(&outcome);
        outcome
    }

    pub(crate) fn report_retry(&self, outcome: &Result<Navigation, ActionError>) {
        match outcome {
            Ok(navigation) => {
                info!(event = "retry_succeeded", kind = %self.kind, id = %self.id, link = %navigation.link);
            }
            Err(error) => {
                warn!(event = "retry_failed", kind = %self.kind, id = %self.id, error = %error);
                self.notify(Notification::error(format!(
                    "There was an error while retrying this {}.",
                    self.kind.noun()
                )));
            }
        }
    }

    /// Closes every stream, stops the ticker, and drops log buffers.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.registry.close_all();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        lock_view(&self.state).logs.clear();
        info!(event = "session_torn_down", kind = %self.kind, id = %self.id);
    }
}

impl Drop for DetailsSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn spawn_progress_ticker(
    state: Arc<Mutex<ViewState>>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let mut view = lock_view(&state);
            view.refresh_progress();
            if view.primary().is_some_and(|record| record.status.is_finished()) {
                debug!(event = "progress_ticker_done", id = %view.primary_id);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(value: serde_json::Value) -> Run {
        serde_json::from_value(value).expect("run")
    }

    fn view_state(record: Run) -> (ViewState, mpsc::UnboundedReceiver<ViewChange>) {
        let (changes, receiver) = mpsc::unbounded_channel();
        let state = ViewState {
            primary_id: record.id.clone(),
            records: RecordCollection::from_snapshot([record]),
            test_groups: RecordCollection::new(),
            test_failures: FilteredCollection::new(TestUpdate::is_failed),
            logs: LogBuffer::new(100),
            log_filter: None,
            test_status: TestStatus::Pending,
            progress: 0,
            changes,
        };
        (state, receiver)
    }

    fn drain(receiver: &mut mpsc::UnboundedReceiver<ViewChange>) -> Vec<ViewChange> {
        let mut changes = Vec::new();
        while let Ok(change) = receiver.try_recv() {
            changes.push(change);
        }
        changes
    }

    #[test]
    fn test_status_follows_record_and_groups() {
        let (mut state, mut receiver) =
            view_state(run(json!({"id": "b1", "status": "in_progress"})));
        assert_eq!(state.derive_test_status(), TestStatus::Pending);

        let finished: RunUpdate =
            serde_json::from_value(json!({"id": "b1", "status": "finished"})).expect("update");
        state.apply_record(&finished);
        assert_eq!(state.test_status, TestStatus::NoResults);

        let group: TestUpdate =
            serde_json::from_value(json!({"id": "g1", "result": "passed"})).expect("group");
        state.apply_test_group(&group);
        assert_eq!(state.test_status, TestStatus::HasResults);

        let changes = drain(&mut receiver);
        assert!(changes.contains(&ViewChange::TestStatus(TestStatus::NoResults)));
        assert!(changes.contains(&ViewChange::TestStatus(TestStatus::HasResults)));
        assert!(changes.contains(&ViewChange::Progress(100)));
    }

    #[tokio::test]
    async fn progress_ticker_stops_once_finished() {
        let (state, mut receiver) =
            view_state(run(json!({"id": "b1", "status": "finished"})));
        let ticker = spawn_progress_ticker(
            Arc::new(Mutex::new(state)),
            std::time::Duration::from_millis(5),
        );
        tokio::time::timeout(std::time::Duration::from_secs(2), ticker)
            .await
            .expect("ticker stopped")
            .expect("ticker joined");
        assert_eq!(drain(&mut receiver), vec![ViewChange::Progress(100)]);
    }

    #[test]
    fn foreign_record_updates_are_ignored() {
        let (mut state, mut receiver) = view_state(run(json!({"id": "b1"})));
        let other: RunUpdate =
            serde_json::from_value(json!({"id": "b2", "name": "other"})).expect("update");
        state.apply_record(&other);
        assert_eq!(state.records.len(), 1);
        assert!(drain(&mut receiver).is_empty());
    }

    #[test]
    fn failed_groups_also_land_in_failures() {
        let (mut state, mut receiver) = view_state(run(json!({"id": "b1"})));
        let failed: TestUpdate =
            serde_json::from_value(json!({"id": 5, "result": {"id": "failed"}})).expect("group");
        state.apply_test_group(&failed);
        state.apply_test_group(&failed);

        let changes = drain(&mut receiver);
        let groups = changes
            .iter()
            .filter(|change| matches!(change, ViewChange::TestGroup { .. }))
            .count();
        let failures = changes
            .iter()
            .filter(|change| matches!(change, ViewChange::TestFailure { .. }))
            .count();
        assert_eq!((groups, failures), (1, 1));
        assert_eq!(state.test_failures.len(), 1);
    }

    #[test]
    fn filtered_log_sources_are_dropped() {
        let (mut state, mut receiver) = view_state(run(json!({"id": "b1"})));
        state.log_filter = Some(HashSet::from(["shown".to_string()]));

        state.apply_log(&LogChunk::new("hidden", 0, "nope"));
        state.apply_log(&LogChunk::new("shown", 0, "yes\n"));
        state.apply_log(&LogChunk::new("shown", 0, "yes\n"));

        assert!(state.logs.source("hidden").is_none());
        let changes = drain(&mut receiver);
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0],
            ViewChange::Log { source_id, .. } if source_id == "shown"
        ));
    }
}
