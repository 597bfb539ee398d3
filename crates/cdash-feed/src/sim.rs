//! Synthetic build/job lifecycles for the development feed.

use std::collections::HashMap;

use cdash_core::{
    LogChunk, ParentRef, Reconcile, Run, RunResult, RunUpdate, Status, TestRecord, TestUpdate,
    Timestamp, BUILD_LOG_UPDATE, BUILD_UPDATE, JOB_UPDATE, TEST_GROUP_UPDATE, TEST_UPDATE,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Builds,
    Jobs,
}

impl Collection {
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Builds => "builds",
            Collection::Jobs => "jobs",
        }
    }

    fn update_event(self) -> &'static str {
        match self {
            Collection::Builds => BUILD_UPDATE,
            Collection::Jobs => JOB_UPDATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub collection: Collection,
    pub resource_id: String,
    pub event: &'static str,
    pub payload: Value,
}

struct SimRun {
    record: Run,
    log_offset: u64,
    tick: u32,
    groups: Vec<TestRecord>,
}

pub struct Simulation {
    runs: HashMap<(Collection, String), SimRun>,
    ticks_per_run: u32,
    tick_ms: u64,
}

impl Simulation {
    pub fn new(ticks_per_run: u32, tick_ms: u64) -> Self {
        Self {
            runs: HashMap::new(),
            ticks_per_run: ticks_per_run.max(1),
            tick_ms,
        }
    }

    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        self.runs.contains_key(&(collection, id.to_string()))
    }

    /// Starts tracking a resource as a queued run. Returns the current record.
    pub fn track(&mut self, collection: Collection, id: &str, now: DateTime<Utc>) -> Run {
        let ticks_per_run = self.ticks_per_run;
        let tick_ms = self.tick_ms;
        self.runs
            .entry((collection, id.to_string()))
            .or_insert_with(|| SimRun {
                record: queued_run(collection, id, ticks_per_run, tick_ms, now),
                log_offset: 0,
                tick: 0,
                groups: Vec::new(),
            })
            .record
            .clone()
    }

    /// Queues a fresh build copied from `id` and returns it.
    pub fn retry(&mut self, collection: Collection, id: &str, now: DateTime<Utc>) -> Option<Run> {
        let source = self.runs.get(&(collection, id.to_string()))?;
        let name = source.record.name.clone();
        let new_id = Uuid::new_v4().simple().to_string();
        let mut record = self.track(Collection::Builds, &new_id, now);
        record.name = name;
        if let Some(run) = self.runs.get_mut(&(Collection::Builds, new_id)) {
            run.record.name = record.name.clone();
        }
        Some(record)
    }

    /// Advances every tracked run by one tick.
    pub fn step(&mut self, now: DateTime<Utc>) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        let ticks_per_run = self.ticks_per_run;
        for ((collection, id), run) in self.runs.iter_mut() {
            run.advance(*collection, id, ticks_per_run, now, &mut events);
        }
        events
    }
}

impl SimRun {
    fn advance(
        &mut self,
        collection: Collection,
        id: &str,
        ticks_per_run: u32,
        now: DateTime<Utc>,
        events: &mut Vec<FeedEvent>,
    ) {
        let emit = |events: &mut Vec<FeedEvent>, event: &'static str, payload: Value| {
            events.push(FeedEvent {
                collection,
                resource_id: id.to_string(),
                event,
                payload,
            });
        };
        let stamp = Some(Some(Timestamp::from(now)));

        match self.record.status {
            Status::Finished => {}
            Status::Unknown | Status::Queued => {
                let update = RunUpdate {
                    id: self.record.id.clone(),
                    status: Some(Status::InProgress),
                    date_started: stamp,
                    date_modified: stamp,
                    ..RunUpdate::default()
                };
                self.apply(&update);
                emit(events, collection.update_event(), to_payload(&self.record));
            }
            Status::InProgress => {
                self.tick += 1;
                let line = format!(
                    "[{}] step {} of {}\n",
                    now.format("%H:%M:%S"),
                    self.tick,
                    ticks_per_run
                );
                let chunk = LogChunk::new("console", self.log_offset, line);
                self.log_offset += chunk.size;
                emit(events, BUILD_LOG_UPDATE, to_payload(&chunk));

                if self.tick % 2 == 0 {
                    let group = self.next_group(now);
                    emit(events, TEST_GROUP_UPDATE, to_payload(&group));
                    if group.result == RunResult::Failed {
                        let test = TestRecord {
                            id: format!("{}-case", group.id),
                            name: Some(format!("{}.test_case", group.name.as_deref().unwrap_or("suite"))),
                            message: Some("AssertionError".to_string()),
                            ..group.clone()
                        };
                        emit(events, TEST_UPDATE, to_payload(&test));
                    }
                }
                if let Some(previous) = self.groups.first() {
                    // Same fields, newer marker.
                    let touched = TestRecord {
                        date_modified: Some(Timestamp::from(now)),
                        ..previous.clone()
                    };
                    emit(events, TEST_GROUP_UPDATE, to_payload(&touched));
                }

                if self.tick >= ticks_per_run {
                    let failed = self
                        .groups
                        .iter()
                        .any(|group| group.result == RunResult::Failed);
                    let duration = self
                        .record
                        .date_started
                        .map(|started| (now - started.as_datetime()).num_milliseconds().max(0) as u64);
                    let update = RunUpdate {
                        id: self.record.id.clone(),
                        status: Some(Status::Finished),
                        result: Some(if failed {
                            RunResult::Failed
                        } else {
                            RunResult::Passed
                        }),
                        duration: Some(duration),
                        date_finished: stamp,
                        date_modified: stamp,
                        ..RunUpdate::default()
                    };
                    self.apply(&update);
                }
                emit(events, collection.update_event(), to_payload(&self.record));
            }
        }
    }

    fn apply(&mut self, update: &RunUpdate) {
        if self.record.merge_fields(update) {
            self.record.merge_marker(update);
        }
    }

    fn next_group(&mut self, now: DateTime<Utc>) -> TestRecord {
        let index = self.groups.len() + 1;
        let result = if roll(6) == 0 {
            RunResult::Failed
        } else {
            RunResult::Passed
        };
        let num_tests = 5 + u64::from(roll(20));
        let group = TestRecord::from_update(&TestUpdate {
            id: format!("{}-group-{index}", self.record.id),
            name: Some(Some(format!("tests.suite_{index}"))),
            package: Some(Some("tests".to_string())),
            result: Some(result),
            duration: Some(Some(u64::from(roll(5_000)))),
            num_tests: Some(Some(num_tests)),
            num_failures: Some(Some(u64::from(result == RunResult::Failed))),
            date_created: Some(Some(Timestamp::from(now))),
            date_modified: Some(Some(Timestamp::from(now))),
            ..TestUpdate::default()
        });
        self.groups.insert(0, group.clone());
        group
    }
}

fn queued_run(
    collection: Collection,
    id: &str,
    ticks_per_run: u32,
    tick_ms: u64,
    now: DateTime<Utc>,
) -> Run {
    let stamp = Some(Some(Timestamp::from(now)));
    let link = format!("/{}/{id}/", collection.as_str());
    let mut record = Run::from_update(&RunUpdate {
        id: id.to_string(),
        name: Some(Some(format!("{} {}", collection.as_str().trim_end_matches('s'), short_id(id)))),
        target: Some(Some(short_id(id).to_string())),
        status: Some(Status::Queued),
        result: Some(RunResult::Unknown),
        estimated_duration: Some(Some((u64::from(ticks_per_run) * tick_ms) as f64)),
        link: Some(Some(link)),
        date_created: stamp,
        date_modified: stamp,
        ..RunUpdate::default()
    });
    if collection == Collection::Jobs {
        let parent_id = format!("{id}-build");
        record.parent = Some(ParentRef {
            link: Some(format!("/builds/{parent_id}/")),
            id: parent_id,
        });
    }
    record
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn to_payload<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| json!({"error": err.to_string()}))
}

fn roll(sides: u32) -> u32 {
    rand::rng().random_range(0..sides.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn runs_move_from_queued_to_finished() {
        let start = Utc::now();
        let mut sim = Simulation::new(4, 1_000);
        let queued = sim.track(Collection::Builds, "b1", start);
        assert_eq!(queued.status, Status::Queued);
        assert_eq!(queued.estimated_duration, Some(4_000.0));

        let first = sim.step(start);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].event, BUILD_UPDATE);
        assert_eq!(first[0].payload["status"]["id"], "in_progress");

        let mut last_status = Value::Null;
        for tick in 1..=4 {
            for event in sim.step(start + Duration::seconds(tick)) {
                if event.event == BUILD_UPDATE {
                    last_status = event.payload["status"]["id"].clone();
                }
            }
        }
        assert_eq!(last_status, "finished");
        assert!(sim.step(start + Duration::seconds(10)).is_empty());
    }

    #[test]
    fn log_offsets_are_contiguous() {
        let start = Utc::now();
        let mut sim = Simulation::new(6, 500);
        sim.track(Collection::Jobs, "j1", start);

        let mut expected = 0u64;
        for tick in 0..6 {
            for event in sim.step(start + Duration::seconds(tick)) {
                if event.event != BUILD_LOG_UPDATE {
                    continue;
                }
                let chunk: LogChunk =
                    serde_json::from_value(event.payload).expect("log chunk payload");
                assert_eq!(chunk.offset, expected);
                expected += chunk.size;
            }
        }
        assert!(expected > 0);
    }

    #[test]
    fn rolls_stay_in_range() {
        assert!((0..200).all(|_| roll(6) < 6));
        assert_eq!(roll(0), 0);
        assert_eq!(roll(1), 0);
    }

    #[test]
    fn jobs_carry_parent_and_retry_needs_a_known_run() {
        let now = Utc::now();
        let mut sim = Simulation::new(2, 100);
        let job = sim.track(Collection::Jobs, "abcdef123456", now);
        assert_eq!(
            job.parent.map(|parent| parent.id),
            Some("abcdef123456-build".to_string())
        );

        assert!(sim.retry(Collection::Jobs, "missing", now).is_none());
        let retried = sim
            .retry(Collection::Jobs, "abcdef123456", now)
            .expect("retry");
        assert!(sim.contains(Collection::Builds, &retried.id));
        assert_eq!(retried.name, job.name);
        assert!(retried.link.is_some());
    }
}
