use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::records::deserialize_id;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

pub const BUILD_UPDATE: &str = "build.update";
pub const JOB_UPDATE: &str = "job.update";
pub const BUILD_LOG_UPDATE: &str = "buildlog.update";
pub const TEST_GROUP_UPDATE: &str = "testgroup.update";
pub const TEST_UPDATE: &str = "test.update";

const DEFAULT_EVENT: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without line break: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("stream line is not valid utf-8")]
    InvalidUtf8,
    #[error("malformed payload for '{event}': {message}")]
    MalformedPayload { event: String, message: String },
    #[error("payload for '{event}' has unexpected shape: {message}")]
    UnexpectedShape { event: String, message: String },
    #[error("frame encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSourceRef {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
}

/// Offset-addressed slice of a log source, as carried by `buildlog.update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub source: LogSourceRef,
    pub offset: u64,
    pub size: u64,
    pub text: String,
}

impl LogChunk {
    pub fn new(source_id: impl Into<String>, offset: u64, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            source: LogSourceRef {
                id: source_id.into(),
            },
            offset,
            size: text.len() as u64,
            text,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source.id
    }
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    pub fn payload(&self) -> Result<Value, ProtocolError> {
        serde_json::from_str(&self.data).map_err(|err| ProtocolError::MalformedPayload {
            event: self.event.clone(),
            message: err.to_string(),
        })
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self.payload()?;
        from_payload(&self.event, &value)
    }
}

/// Reads an already-parsed payload as `T`.
pub fn from_payload<T: DeserializeOwned>(event: &str, value: &Value) -> Result<T, ProtocolError> {
    T::deserialize(value).map_err(|err| ProtocolError::UnexpectedShape {
        event: event.to_string(),
        message: err.to_string(),
    })
}

pub fn encode_event(event: &str, payload: &Value, id: Option<&str>) -> Result<String, ProtocolError> {
    let data = serde_json::to_string(payload).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    let mut out = String::with_capacity(data.len() + event.len() + 32);
    if let Some(id) = id {
        if id.contains(['\n', '\r']) {
            return Err(ProtocolError::Encode("event id contains a line break".to_string()));
        }
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    out.push_str("event: ");
    out.push_str(event);
    out.push('\n');
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<ProtocolError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.errors.is_empty()
    }

    fn extend(&mut self, other: DecodeReport<T>) {
        self.frames.extend(other.frames);
        self.errors.extend(other.errors);
    }
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes arrive in arbitrary slices; complete events come out once their
/// terminating blank line has been seen. Errors poison only the event being
/// assembled.
pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    event: Option<String>,
    data: String,
    has_data: bool,
    discard: bool,
    last_event_id: Option<String>,
    retry_ms: Option<u64>,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            event: None,
            data: String::new(),
            has_data: false,
            discard: false,
            last_event_id: None,
            retry_ms: None,
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay requested by the server via `retry:`.
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<SseFrame> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(ProtocolError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
            self.discard = true;
        }

        report
    }

    /// Flushes a trailing line and any event left unterminated at end of stream.
    pub fn finish(&mut self) -> DecodeReport<SseFrame> {
        let mut report = DecodeReport::default();
        if !self.pending.is_empty() {
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }
        let mut tail = DecodeReport::default();
        self.dispatch(&mut tail);
        report.extend(tail);
        report
    }

    /// Drops partial state, keeping the last event id for resumption.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.clear_event();
    }

    fn process_line(&mut self, line: &[u8], report: &mut DecodeReport<SseFrame>) {
        if line.is_empty() {
            self.dispatch(report);
            return;
        }
        if line[0] == b':' {
            return;
        }

        let Ok(line) = std::str::from_utf8(line) else {
            report.errors.push(ProtocolError::InvalidUtf8);
            self.discard = true;
            return;
        };

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.discard {
                    return;
                }
                let size = self.data.len() + value.len() + usize::from(self.has_data);
                if size > self.max_frame_bytes {
                    report.errors.push(ProtocolError::OversizedFrame {
                        size,
                        max: self.max_frame_bytes,
                    });
                    self.discard = true;
                    self.data.clear();
                    return;
                }
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry_ms = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport<SseFrame>) {
        if self.has_data && !self.discard {
            report.frames.push(SseFrame {
                event: self
                    .event
                    .take()
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
                data: std::mem::take(&mut self.data),
                id: self.last_event_id.clone(),
            });
        }
        self.clear_event();
    }

    fn clear_event(&mut self) {
        self.event = None;
        self.data.clear();
        self.has_data = false;
        self.discard = false;
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
