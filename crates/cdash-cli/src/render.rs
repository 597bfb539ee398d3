use std::collections::HashMap;

use cdash_core::{LogView, Run, TestRecord};
use cdash_stream::{NotificationLevel, ViewChange};

/// Turns view changes into terminal lines.
#[derive(Default)]
pub struct Printer {
    logs: HashMap<String, LogView>,
    show_logs: bool,
}

impl Printer {
    pub fn new(show_logs: bool) -> Self {
        Self {
            logs: HashMap::new(),
            show_logs,
        }
    }

    pub fn lines(&mut self, change: &ViewChange) -> Vec<String> {
        match change {
            ViewChange::Record(record) => vec![describe_run(record)],
            ViewChange::TestStatus(status) => vec![format!("tests: {}", status.as_str())],
            ViewChange::TestGroup {
                record, inserted, ..
            } => vec![describe_test("group", record, *inserted)],
            ViewChange::TestFailure {
                record, inserted, ..
            } => vec![describe_test("failure", record, *inserted)],
            ViewChange::Progress(percent) => vec![format!("progress: {percent}%")],
            ViewChange::Notification(notification) => {
                let level = match notification.level {
                    NotificationLevel::Info => "info",
                    NotificationLevel::Error => "error",
                };
                vec![format!("[{level}] {}", notification.message)]
            }
            ViewChange::Log { source_id, delta } => {
                let view = self.logs.entry(source_id.clone()).or_default();
                let before = if delta.reset {
                    0
                } else {
                    view.len().saturating_sub(delta.trimmed_line_count)
                };
                view.apply(delta);
                if !self.show_logs {
                    return Vec::new();
                }
                // The last rendered line may still grow, so only settled lines print.
                let settled = view.len().saturating_sub(1);
                let first_new = if delta.continues_last_line {
                    before.saturating_sub(1)
                } else {
                    before
                };
                view.lines()
                    .enumerate()
                    .filter(|(idx, _)| *idx >= first_new && *idx < settled)
                    .map(|(_, line)| format!("{source_id} | {line}"))
                    .collect()
            }
        }
    }
}

fn describe_run(record: &Run) -> String {
    let name = record.name.as_deref().unwrap_or(&record.id);
    let mut line = format!("{name}: {}", record.status.label());
    if record.status.is_finished() {
        line.push_str(&format!(" ({})", record.result.label()));
        if let Some(duration) = record.duration {
            line.push_str(&format!(" in {}", format_duration(duration)));
        }
    }
    line
}

fn describe_test(kind: &str, record: &TestRecord, inserted: bool) -> String {
    let verb = if inserted { "new" } else { "updated" };
    let name = record.name.as_deref().unwrap_or(&record.id);
    format!("{kind} {verb}: {name} {}", record.result.label())
}

fn format_duration(ms: u64) -> String {
    let seconds = ms / 1000;
    if seconds >= 60 {
        format!("{}m{:02}s", seconds / 60, seconds % 60)
    } else if seconds > 0 {
        format!("{seconds}s")
    } else {
        format!("{ms}ms")
    }
}
