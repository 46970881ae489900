use chrono::{DateTime, SecondsFormat, Utc};

pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// The end of an interval landed before its start. Carries both endpoints in
/// epoch milliseconds so callers can report the exact pair that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidInterval {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Elapsed time on a pass. `is_final` is false while the pass is still open
/// (the end point was "now", not a recorded time-in).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassDuration {
    pub millis: i64,
    pub is_final: bool,
}

/// Duration of a pass from its time-out to either its time-in (final) or the
/// caller-supplied `now` (ongoing). Never reads the clock itself.
pub fn pass_duration(
    time_out: DateTime<Utc>,
    time_in: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<PassDuration, InvalidInterval> {
    let (end, is_final) = match time_in {
        Some(t) => (t, true),
        None => (now, false),
    };
    let start_ms = time_out.timestamp_millis();
    let end_ms = end.timestamp_millis();
    if end_ms < start_ms {
        return Err(InvalidInterval { start_ms, end_ms });
    }
    Ok(PassDuration {
        millis: end_ms - start_ms,
        is_final,
    })
}

impl PassDuration {
    /// Whole (hours, minutes, seconds); sub-second millis are truncated.
    pub fn breakdown(&self) -> (i64, i64, i64) {
        let total_seconds = self.millis / 1000;
        (
            total_seconds / 3600,
            (total_seconds % 3600) / 60,
            total_seconds % 60,
        )
    }

    pub fn total_minutes(&self) -> i64 {
        self.millis / 60_000
    }

    /// "1h 7m 3s" / "7m 0s" / "42s"; zero-valued leading units are dropped.
    pub fn compact(&self) -> String {
        let (h, m, s) = self.breakdown();
        if h > 0 {
            format!("{}h {}m {}s", h, m, s)
        } else if m > 0 {
            format!("{}m {}s", m, s)
        } else {
            format!("{}s", s)
        }
    }
}

/// Coarser rendering for the line's "time waiting" column: "1h 5m" / "5m" /
/// "30s". Waiting time is informational, so a clock skew that puts `joined`
/// after `now` renders as "0s" instead of failing.
pub fn waiting_compact(time_joined: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = ((now.timestamp_millis() - time_joined.timestamp_millis()) / 1000).max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", seconds)
    }
}
