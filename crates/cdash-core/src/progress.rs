use chrono::{DateTime, Utc};

/// Highest value reported while a run is still going.
pub const RUNNING_PROGRESS_CAP: u8 = 95;

/// Percentage of the estimated duration that has elapsed, in `[0, 100]`.
pub fn progress(
    now: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    estimated_duration_ms: Option<f64>,
    is_finished: bool,
) -> u8 {
    if is_finished {
        return 100;
    }
    let Some(started_at) = started_at else {
        return 0;
    };
    let estimate = match estimated_duration_ms {
        Some(estimate) if estimate.is_finite() && estimate > 0.0 => estimate,
        _ => return 0,
    };

    let elapsed_ms = (now - started_at).num_milliseconds().max(0) as f64;
    let percent = elapsed_ms / estimate * 100.0;
    percent.clamp(0.0, f64::from(RUNNING_PROGRESS_CAP)) as u8
}
