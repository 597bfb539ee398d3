use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::merge::{merge_field, Keyed, Reconcile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Unknown,
    Queued,
    InProgress,
    Finished,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Queued => "queued",
            Status::InProgress => "in_progress",
            Status::Finished => "finished",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Status::Unknown => "unknown",
            Status::Queued => "queued",
            Status::InProgress => "in progress",
            Status::Finished => "finished",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Status::Finished)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "unknown" => Ok(Status::Unknown),
            "queued" => Ok(Status::Queued),
            "in_progress" | "in progress" | "in-progress" | "inprogress" => Ok(Status::InProgress),
            "finished" => Ok(Status::Finished),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// Outcome of a build, job, or test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunResult {
    #[default]
    Unknown,
    Passed,
    Failed,
    Skipped,
    Errored,
    Aborted,
    TimedOut,
}

impl RunResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RunResult::Unknown => "unknown",
            RunResult::Passed => "passed",
            RunResult::Failed => "failed",
            RunResult::Skipped => "skipped",
            RunResult::Errored => "errored",
            RunResult::Aborted => "aborted",
            RunResult::TimedOut => "timedout",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RunResult::TimedOut => "timed out",
            other => other.as_str(),
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            RunResult::Failed | RunResult::Errored | RunResult::TimedOut
        )
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for RunResult {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "unknown" => Ok(RunResult::Unknown),
            "passed" => Ok(RunResult::Passed),
            "failed" => Ok(RunResult::Failed),
            "skipped" => Ok(RunResult::Skipped),
            "errored" => Ok(RunResult::Errored),
            "aborted" => Ok(RunResult::Aborted),
            "timedout" | "timed out" | "timed_out" => Ok(RunResult::TimedOut),
            other => Err(format!("Unknown result: {other}")),
        }
    }
}

#[derive(Serialize)]
struct LabelOut<'a> {
    id: &'a str,
    name: &'a str,
}

/// Status and result travel as `{"id": "...", "name": "..."}`; bare strings are accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum LabelIn {
    Object { id: String },
    Plain(String),
}

impl LabelIn {
    fn into_id(self) -> String {
        match self {
            LabelIn::Object { id } => id,
            LabelIn::Plain(id) => id,
        }
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        LabelOut {
            id: self.as_str(),
            name: self.label(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let id = LabelIn::deserialize(deserializer)?.into_id();
        id.parse().map_err(de::Error::custom)
    }
}

impl Serialize for RunResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        LabelOut {
            id: self.as_str(),
            name: self.label(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RunResult {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let id = LabelIn::deserialize(deserializer)?.into_id();
        id.parse().map_err(de::Error::custom)
    }
}

/// A UTC instant. Accepts RFC 3339 strings, offset-less ISO strings (read as UTC),
/// and epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(Self(parsed.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
            .map(|naive| Self(Utc.from_utc_datetime(&naive)))
    }

    pub fn from_millis(ms: i64) -> Option<Self> {
        Utc.timestamp_millis_opt(ms).single().map(Self)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TimestampVisitor;

        impl<'de> Visitor<'de> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an ISO 8601 timestamp or epoch milliseconds")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Timestamp::from_millis(value)
                    .ok_or_else(|| E::custom(format!("timestamp out of range: {value}")))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let value = i64::try_from(value)
                    .map_err(|_| E::custom(format!("timestamp out of range: {value}")))?;
                self.visit_i64(value)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Timestamp::parse(value)
                    .ok_or_else(|| E::custom(format!("invalid timestamp '{value}'")))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub link: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// A build or a job. Both travel with the same serializer shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub result: RunResult,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author: Option<Author>,
    /// Owning build, present on jobs.
    #[serde(default, alias = "build")]
    pub parent: Option<ParentRef>,
    #[serde(default)]
    pub external: Option<ExternalLink>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub estimated_duration: Option<f64>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub date_created: Option<Timestamp>,
    #[serde(default)]
    pub date_started: Option<Timestamp>,
    #[serde(default)]
    pub date_finished: Option<Timestamp>,
    #[serde(default)]
    pub date_modified: Option<Timestamp>,
}

impl Run {
    pub fn progress_at(&self, now: DateTime<Utc>) -> u8 {
        crate::progress::progress(
            now,
            self.date_started.map(|ts| ts.as_datetime()),
            self.estimated_duration,
            self.status.is_finished(),
        )
    }
}

/// Partial build/job payload. `None` means the field was absent;
/// `Some(None)` means it was sent as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunUpdate {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub target: Option<Option<String>>,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub result: Option<RunResult>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub message: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub author: Option<Option<Author>>,
    #[serde(default, alias = "build", deserialize_with = "deserialize_present")]
    pub parent: Option<Option<ParentRef>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub external: Option<Option<ExternalLink>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub duration: Option<Option<u64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub estimated_duration: Option<Option<f64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub link: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub date_created: Option<Option<Timestamp>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub date_started: Option<Option<Timestamp>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub date_finished: Option<Option<Timestamp>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub date_modified: Option<Option<Timestamp>>,
}

impl From<Run> for RunUpdate {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            name: Some(run.name),
            target: Some(run.target),
            status: Some(run.status),
            result: Some(run.result),
            message: Some(run.message),
            author: Some(run.author),
            parent: Some(run.parent),
            external: Some(run.external),
            duration: Some(run.duration),
            estimated_duration: Some(run.estimated_duration),
            link: Some(run.link),
            date_created: Some(run.date_created),
            date_started: Some(run.date_started),
            date_finished: Some(run.date_finished),
            date_modified: Some(run.date_modified),
        }
    }
}

impl Keyed for Run {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for RunUpdate {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Reconcile for Run {
    type Update = RunUpdate;

    fn from_update(update: &RunUpdate) -> Self {
        Self {
            id: update.id.clone(),
            name: update.name.clone().flatten(),
            target: update.target.clone().flatten(),
            status: update.status.unwrap_or_default(),
            result: update.result.unwrap_or_default(),
            message: update.message.clone().flatten(),
            author: update.author.clone().flatten(),
            parent: update.parent.clone().flatten(),
            external: update.external.clone().flatten(),
            duration: update.duration.flatten(),
            estimated_duration: update.estimated_duration.flatten(),
            link: update.link.clone().flatten(),
            date_created: update.date_created.flatten(),
            date_started: update.date_started.flatten(),
            date_finished: update.date_finished.flatten(),
            date_modified: update.date_modified.flatten(),
        }
    }

    fn merge_fields(&mut self, update: &RunUpdate) -> bool {
        // Non-short-circuiting `|` so every differing field is copied.
        merge_field(&mut self.name, update.name.as_ref())
            | merge_field(&mut self.target, update.target.as_ref())
            | merge_field(&mut self.status, update.status.as_ref())
            | merge_field(&mut self.result, update.result.as_ref())
            | merge_field(&mut self.message, update.message.as_ref())
            | merge_field(&mut self.author, update.author.as_ref())
            | merge_field(&mut self.parent, update.parent.as_ref())
            | merge_field(&mut self.external, update.external.as_ref())
            | merge_field(&mut self.duration, update.duration.as_ref())
            | merge_field(&mut self.estimated_duration, update.estimated_duration.as_ref())
            | merge_field(&mut self.link, update.link.as_ref())
            | merge_field(&mut self.date_created, update.date_created.as_ref())
            | merge_field(&mut self.date_started, update.date_started.as_ref())
            | merge_field(&mut self.date_finished, update.date_finished.as_ref())
    }

    fn merge_marker(&mut self, update: &RunUpdate) {
        if let Some(marker) = update.date_modified {
            self.date_modified = marker;
        }
    }
}

/// A test group or an individual test; both share one payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: RunResult,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub num_tests: Option<u64>,
    #[serde(default)]
    pub num_failures: Option<u64>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub date_created: Option<Timestamp>,
    #[serde(default)]
    pub date_modified: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestUpdate {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub package: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub message: Option<Option<String>>,
    #[serde(default)]
    pub result: Option<RunResult>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub duration: Option<Option<u64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub num_tests: Option<Option<u64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub num_failures: Option<Option<u64>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub link: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub date_created: Option<Option<Timestamp>>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub date_modified: Option<Option<Timestamp>>,
}

impl TestUpdate {
    pub fn is_failed(&self) -> bool {
        self.result == Some(RunResult::Failed)
    }
}

impl From<TestRecord> for TestUpdate {
    fn from(record: TestRecord) -> Self {
        Self {
            id: record.id,
            name: Some(record.name),
            package: Some(record.package),
            message: Some(record.message),
            result: Some(record.result),
            duration: Some(record.duration),
            num_tests: Some(record.num_tests),
            num_failures: Some(record.num_failures),
            link: Some(record.link),
            date_created: Some(record.date_created),
            date_modified: Some(record.date_modified),
        }
    }
}

impl Keyed for TestRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for TestUpdate {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Reconcile for TestRecord {
    type Update = TestUpdate;

    fn from_update(update: &TestUpdate) -> Self {
        Self {
            id: update.id.clone(),
            name: update.name.clone().flatten(),
            package: update.package.clone().flatten(),
            message: update.message.clone().flatten(),
            result: update.result.unwrap_or_default(),
            duration: update.duration.flatten(),
            num_tests: update.num_tests.flatten(),
            num_failures: update.num_failures.flatten(),
            link: update.link.clone().flatten(),
            date_created: update.date_created.flatten(),
            date_modified: update.date_modified.flatten(),
        }
    }

    fn merge_fields(&mut self, update: &TestUpdate) -> bool {
        merge_field(&mut self.name, update.name.as_ref())
            | merge_field(&mut self.package, update.package.as_ref())
            | merge_field(&mut self.message, update.message.as_ref())
            | merge_field(&mut self.result, update.result.as_ref())
            | merge_field(&mut self.duration, update.duration.as_ref())
            | merge_field(&mut self.num_tests, update.num_tests.as_ref())
            | merge_field(&mut self.num_failures, update.num_failures.as_ref())
            | merge_field(&mut self.link, update.link.as_ref())
            | merge_field(&mut self.date_created, update.date_created.as_ref())
    }

    fn merge_marker(&mut self, update: &TestUpdate) {
        if let Some(marker) = update.date_modified {
            self.date_modified = marker;
        }
    }
}

/// Deserialize an ID that can be either a string or a number into a String
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(de::Error::custom("expected string or number for id")),
    }
}

/// Keeps an explicit `null` distinguishable from an absent field.
fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_and_result_accept_object_and_plain_forms() {
        let status: Status =
            serde_json::from_value(json!({"id": "in_progress", "name": "in progress"}))
                .expect("object status");
        assert_eq!(status, Status::InProgress);
        let result: RunResult = serde_json::from_value(json!("timedout")).expect("plain result");
        assert_eq!(result, RunResult::TimedOut);
        assert!(serde_json::from_value::<Status>(json!({"id": "exploded"})).is_err());

        let encoded = serde_json::to_value(RunResult::TimedOut).expect("encode");
        assert_eq!(encoded, json!({"id": "timedout", "name": "timed out"}));
    }

    #[test]
    fn timestamp_accepts_offsetless_iso_and_millis() {
        let with_offset = Timestamp::parse("2014-01-02T03:04:05+00:00").expect("rfc3339");
        let naive = Timestamp::parse("2014-01-02T03:04:05.000000").expect("naive");
        assert_eq!(with_offset, naive);

        let millis: Timestamp = serde_json::from_value(json!(1_388_631_845_000i64)).expect("ms");
        assert_eq!(millis, with_offset);
        assert!(serde_json::from_value::<Timestamp>(json!("yesterday")).is_err());
    }

    #[test]
    fn run_update_distinguishes_null_from_absent() {
        let update: RunUpdate = serde_json::from_value(json!({
            "id": 42,
            "dateFinished": null,
            "status": {"id": "finished", "name": "finished"}
        }))
        .expect("parse update");

        assert_eq!(update.id, "42");
        assert_eq!(update.date_finished, Some(None));
        assert_eq!(update.name, None);
        assert_eq!(update.status, Some(Status::Finished));
    }

    #[test]
    fn run_from_update_fills_defaults() {
        let update: RunUpdate = serde_json::from_value(json!({
            "id": "b1",
            "name": "Build #1",
            "estimatedDuration": 1500.5
        }))
        .expect("parse update");
        let run = Run::from_update(&update);
        assert_eq!(run.name.as_deref(), Some("Build #1"));
        assert_eq!(run.status, Status::Unknown);
        assert_eq!(run.estimated_duration, Some(1500.5));
        assert!(run.date_started.is_none());
    }

    #[test]
    fn test_update_failure_predicate_reads_result_id() {
        let failed: TestUpdate =
            serde_json::from_value(json!({"id": 5, "result": {"id": "failed"}})).expect("parse");
        let passed: TestUpdate =
            serde_json::from_value(json!({"id": 6, "result": "passed"})).expect("parse");
        let missing: TestUpdate = serde_json::from_value(json!({"id": 7})).expect("parse");
        assert!(failed.is_failed());
        assert!(!passed.is_failed());
        assert!(!missing.is_failed());
    }
}
