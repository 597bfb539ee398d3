//! Bounded per-source log accumulation.
//!
//! Each source keeps at most `capacity` characters of the most recent text and
//! reports the minimal line-level delta needed to keep a rendered view in step.

use std::collections::{HashMap, VecDeque};

use crate::wire::LogChunk;

pub const DEFAULT_LOG_BUFFER_CHARS: usize = 10_000;

/// Line-level change produced by one accepted chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogDelta {
    pub appended_lines: Vec<String>,
    /// Whole lines to drop from the front of the rendered view.
    pub trimmed_line_count: usize,
    /// The first appended line extends the last rendered line.
    pub continues_last_line: bool,
    /// The rendered view must be cleared before appending.
    pub reset: bool,
}

impl LogDelta {
    pub fn is_empty(&self) -> bool {
        self.appended_lines.is_empty() && self.trimmed_line_count == 0 && !self.reset
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    Accepted(LogDelta),
    /// Offset already consumed; nothing changed.
    Rejected { next_offset: u64 },
}

impl Ingest {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Ingest::Accepted(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSourceState {
    text: String,
    char_len: usize,
    line_count: usize,
    next_offset: u64,
}

impl LogSourceState {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.char_len
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    fn ingest(&mut self, chunk: &LogChunk, capacity: usize) -> Ingest {
        if chunk.offset < self.next_offset {
            return Ingest::Rejected {
                next_offset: self.next_offset,
            };
        }
        self.next_offset = chunk.offset.saturating_add(chunk.size);

        if chunk.text.is_empty() {
            return Ingest::Accepted(LogDelta::default());
        }

        let incoming = chunk.text.chars().count();
        if self.char_len > capacity || incoming >= capacity {
            return Ingest::Accepted(self.reset_window(&chunk.text, incoming, capacity));
        }

        let mut delta = LogDelta::default();
        let overflow = (self.char_len + incoming).saturating_sub(capacity);
        if overflow > 0 {
            let cut = byte_index(&self.text, overflow);
            let trimmed = self.text[..cut].matches('\n').count();
            self.text.drain(..cut);
            self.char_len -= overflow;
            self.line_count -= trimmed;
            delta.trimmed_line_count = trimmed;
        }

        delta.continues_last_line = !self.text.is_empty();
        delta.appended_lines = chunk.text.split('\n').map(str::to_string).collect();
        self.line_count += delta.appended_lines.len();
        if delta.continues_last_line {
            self.line_count -= 1;
        }
        self.text.push_str(&chunk.text);
        self.char_len += incoming;
        Ingest::Accepted(delta)
    }

    /// Rebuilds the retained window from scratch: the last `capacity`
    /// characters of the prior text followed by `chunk`.
    fn reset_window(&mut self, chunk: &str, incoming: usize, capacity: usize) -> LogDelta {
        let trimmed = self.line_count;
        if incoming >= capacity {
            let skip = byte_index(chunk, incoming - capacity);
            self.text = chunk[skip..].to_string();
            self.char_len = capacity;
        } else {
            self.text.push_str(chunk);
            let total = self.char_len + incoming;
            let cut = byte_index(&self.text, total - capacity);
            self.text.drain(..cut);
            self.char_len = capacity;
        }

        let appended_lines: Vec<String> = self.text.split('\n').map(str::to_string).collect();
        self.line_count = appended_lines.len();
        LogDelta {
            appended_lines,
            trimmed_line_count: trimmed,
            continues_last_line: false,
            reset: true,
        }
    }
}

fn byte_index(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

/// All log sources of one view.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    capacity: usize,
    sources: HashMap<String, LogSourceState>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER_CHARS)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sources: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Applies to subsequent ingests. Sources already over the new limit take
    /// the reset path on their next chunk.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn ingest(&mut self, chunk: &LogChunk) -> Ingest {
        let capacity = self.capacity;
        self.sources
            .entry(chunk.source.id.clone())
            .or_default()
            .ingest(chunk, capacity)
    }

    pub fn source(&self, source_id: &str) -> Option<&LogSourceState> {
        self.sources.get(source_id)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }
}

/// Rendered line list driven purely by `LogDelta`s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogView {
    lines: VecDeque<String>,
}

impl LogView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &LogDelta) {
        if delta.reset {
            self.lines.clear();
        } else {
            let drop = delta.trimmed_line_count.min(self.lines.len());
            self.lines.drain(..drop);
        }

        let mut appended = delta.appended_lines.iter();
        if delta.continues_last_line {
            if let Some(first) = appended.next() {
                match self.lines.back_mut() {
                    Some(last) => last.push_str(first),
                    None => self.lines.push_back(first.clone()),
                }
            }
        }
        self.lines.extend(appended.cloned());
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(outcome: Ingest) -> LogDelta {
        match outcome {
            Ingest::Accepted(delta) => delta,
            other => panic!("expected accepted chunk, got {other:?}"),
        }
    }

    #[test]
    fn window_example_without_newlines() {
        let mut buffer = LogBuffer::new(100);
        let first = accepted(buffer.ingest(&LogChunk::new("s", 0, "A".repeat(60))));
        assert_eq!(first.appended_lines, vec!["A".repeat(60)]);
        assert_eq!(buffer.source("s").map(LogSourceState::next_offset), Some(60));

        let second = accepted(buffer.ingest(&LogChunk::new("s", 60, "B".repeat(50))));
        let state = buffer.source("s").expect("state");
        assert_eq!(state.next_offset(), 110);
        assert_eq!(second.trimmed_line_count, 0);
        assert!(second.continues_last_line);
        assert!(!second.reset);
        assert_eq!(state.text(), format!("{}{}", "A".repeat(50), "B".repeat(50)));
        assert_eq!(state.char_len(), 100);
        assert_eq!(state.line_count(), 1);
    }

    #[test]
    fn duplicate_chunk_is_rejected() {
        let mut buffer = LogBuffer::new(100);
        let chunk = LogChunk::new("s", 0, "hello\n");
        assert!(buffer.ingest(&chunk).is_accepted());
        let before = buffer.source("s").cloned();

        assert_eq!(buffer.ingest(&chunk), Ingest::Rejected { next_offset: 6 });
        assert_eq!(buffer.source("s").cloned(), before);
    }

    #[test]
    fn gaps_are_accepted_and_size_drives_next_offset() {
        let mut buffer = LogBuffer::new(100);
        let mut chunk = LogChunk::new("s", 40, "héllo");
        chunk.size = 6;
        assert!(buffer.ingest(&chunk).is_accepted());
        assert_eq!(buffer.source("s").map(LogSourceState::next_offset), Some(46));
        assert!(!buffer.ingest(&LogChunk::new("s", 45, "x")).is_accepted());
    }

    #[test]
    fn trimming_reports_whole_lines_only() {
        let mut buffer = LogBuffer::new(12);
        let mut view = LogView::new();
        view.apply(&accepted(buffer.ingest(&LogChunk::new("s", 0, "one\ntwo\nth"))));
        assert_eq!(view.lines().collect::<Vec<_>>(), vec!["one", "two", "th"]);

        // Four characters over: "one\n" goes.
        let delta = accepted(buffer.ingest(&LogChunk::new("s", 10, "ree\nfo")));
        assert_eq!(delta.trimmed_line_count, 1);
        assert!(delta.continues_last_line);
        view.apply(&delta);

        let state = buffer.source("s").expect("state");
        assert_eq!(state.text(), "two\nthree\nfo");
        assert_eq!(view.lines().collect::<Vec<_>>(), vec!["two", "three", "fo"]);
        assert!(view.render().ends_with(state.text()));
    }

    #[test]
    fn chunk_filling_the_window_resets_the_view() {
        let mut buffer = LogBuffer::new(8);
        let mut view = LogView::new();
        view.apply(&accepted(buffer.ingest(&LogChunk::new("s", 0, "a\nb"))));

        let delta = accepted(buffer.ingest(&LogChunk::new("s", 3, "0123\n456789")));
        assert!(delta.reset);
        assert_eq!(delta.trimmed_line_count, 2);
        view.apply(&delta);

        let state = buffer.source("s").expect("state");
        assert_eq!(state.text(), "3\n456789");
        assert_eq!(view.render(), "3\n456789");
    }

    #[test]
    fn lowered_capacity_takes_reset_path() {
        let mut buffer = LogBuffer::new(20);
        let mut view = LogView::new();
        view.apply(&accepted(buffer.ingest(&LogChunk::new("s", 0, "abcdef\nghijkl"))));

        buffer.set_capacity(5);
        let delta = accepted(buffer.ingest(&LogChunk::new("s", 13, "\nz")));
        assert!(delta.reset);
        view.apply(&delta);

        let state = buffer.source("s").expect("state");
        assert_eq!(state.text(), "jkl\nz");
        assert_eq!(view.render(), "jkl\nz");
        assert_eq!(state.line_count(), 2);
    }

    #[test]
    fn view_tracks_retained_text_over_many_chunks() {
        let capacity = 37;
        let mut buffer = LogBuffer::new(capacity);
        let mut view = LogView::new();
        let mut offset = 0u64;

        for step in 0..200usize {
            let width = (step * 7) % 23;
            let mut text = String::new();
            for idx in 0..width {
                if (idx + step) % 5 == 0 {
                    text.push('\n');
                } else {
                    text.push(char::from(b'a' + ((idx + step) % 26) as u8));
                }
            }
            if step % 3 == 0 {
                text.push('ü');
            }
            let chunk = LogChunk::new("s", offset, text);
            offset += chunk.size;
            view.apply(&accepted(buffer.ingest(&chunk)));

            let state = buffer.source("s").expect("state");
            assert!(state.char_len() <= capacity);
            assert_eq!(state.char_len(), state.text().chars().count());
            if !state.text().is_empty() {
                assert_eq!(state.line_count(), state.text().split('\n').count());
            }
            assert_eq!(view.len(), state.line_count());
            assert!(view.render().ends_with(state.text()));
        }
    }

    #[test]
    fn sources_are_independent() {
        let mut buffer = LogBuffer::default();
        assert_eq!(buffer.capacity(), DEFAULT_LOG_BUFFER_CHARS);
        assert!(buffer.ingest(&LogChunk::new("a", 0, "x")).is_accepted());
        assert!(buffer.ingest(&LogChunk::new("b", 0, "y")).is_accepted());
        assert_eq!(buffer.source_ids().count(), 2);

        buffer.clear();
        assert!(buffer.source("a").is_none());
    }
}
