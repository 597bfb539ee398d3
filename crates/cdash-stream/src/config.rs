use std::time::Duration;

use cdash_core::{DEFAULT_LOG_BUFFER_CHARS, DEFAULT_MAX_FRAME_BYTES};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_PROGRESS_TICK: Duration = Duration::from_millis(500);

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub base_url: String,
    pub log_buffer_chars: usize,
    pub reconnect: bool,
    pub progress_tick: Duration,
    pub max_frame_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            log_buffer_chars: DEFAULT_LOG_BUFFER_CHARS,
            reconnect: true,
            progress_tick: DEFAULT_PROGRESS_TICK,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl StreamConfig {
    /// Reads `CDASH_*` variables, falling back to defaults for anything
    /// missing or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            base_url: resolve_base_url(lookup("CDASH_BASE_URL")),
            log_buffer_chars: resolve_positive(lookup("CDASH_LOG_BUFFER_CHARS"))
                .unwrap_or(defaults.log_buffer_chars),
            reconnect: lookup("CDASH_RECONNECT")
                .and_then(|value| parse_bool_flag(&value))
                .unwrap_or(defaults.reconnect),
            progress_tick: resolve_positive(lookup("CDASH_PROGRESS_TICK_MS"))
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(defaults.progress_tick),
            max_frame_bytes: resolve_positive(lookup("CDASH_MAX_FRAME_BYTES"))
                .unwrap_or(defaults.max_frame_bytes),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = normalize_base_url(&base_url.into());
        self
    }

    /// `{base}/api/0/{collection}/{id}/`
    pub fn resource_url(&self, collection: &str, id: &str) -> String {
        format!("{}/api/0/{collection}/{id}/", self.base_url)
    }
}

fn resolve_base_url(value: Option<String>) -> String {
    match value {
        Some(value) if !value.trim().is_empty() => normalize_base_url(&value),
        _ => DEFAULT_BASE_URL.to_string(),
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}

fn resolve_positive(value: Option<String>) -> Option<usize> {
    value
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|parsed| *parsed > 0)
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        next
    }
}
