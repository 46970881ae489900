use crate::calc::InvalidInterval;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct PassRow {
    pub id: String,
    pub teacher_id: String,
    pub student_id: Option<String>,
    pub student_name: String,
    pub destination: Option<String>,
    pub time_out: DateTime<Utc>,
    pub time_in: Option<DateTime<Utc>>,
    pub is_tablet_user: bool,
    pub created_at: DateTime<Utc>,
}

impl PassRow {
    pub fn is_open(&self) -> bool {
        self.time_in.is_none()
    }
}

/// The closed set of pass edits. There is deliberately no variant that clears
/// `time_in`: reopening a pass goes through [`reopen`] and nowhere else.
#[derive(Debug, Clone, PartialEq)]
pub enum PassEdit {
    RenameStudent(String),
    SetDestination(Option<String>),
    SetTimeOut(DateTime<Utc>),
    SetTimeIn(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassError {
    EmptyName,
    Interval(InvalidInterval),
}

fn interval_error(row: &PassRow, time_in: DateTime<Utc>) -> PassError {
    PassError::Interval(InvalidInterval {
        start_ms: row.time_out.timestamp_millis(),
        end_ms: time_in.timestamp_millis(),
    })
}

fn normalize_destination(destination: Option<String>) -> Option<String> {
    destination.and_then(|d| {
        let t = d.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Opens a new pass. `time_out` defaults to `now` when the caller did not
/// supply one; the student name must be non-empty after trimming.
#[allow(clippy::too_many_arguments)]
pub fn new_pass(
    teacher_id: &str,
    student_id: Option<String>,
    student_name: &str,
    destination: Option<String>,
    is_tablet_user: bool,
    time_out: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<PassRow, PassError> {
    let name = student_name.trim();
    if name.is_empty() {
        return Err(PassError::EmptyName);
    }
    Ok(PassRow {
        id: Uuid::new_v4().to_string(),
        teacher_id: teacher_id.to_string(),
        student_id,
        student_name: name.to_string(),
        destination: normalize_destination(destination),
        time_out: time_out.unwrap_or(now),
        time_in: None,
        is_tablet_user,
        created_at: now,
    })
}

/// Open -> Closed. Rejects a time-in earlier than the recorded time-out.
pub fn close(pass: &PassRow, time_in: DateTime<Utc>) -> Result<PassRow, PassError> {
    if time_in < pass.time_out {
        return Err(interval_error(pass, time_in));
    }
    let mut next = pass.clone();
    next.time_in = Some(time_in);
    Ok(next)
}

/// Applies every edit, then validates the result once: a batch that moves both
/// endpoints is judged on where it lands, not on the order the fields arrive.
pub fn apply_edits(pass: &PassRow, edits: &[PassEdit]) -> Result<PassRow, PassError> {
    let mut next = pass.clone();
    for edit in edits {
        match edit {
            PassEdit::RenameStudent(name) => next.student_name = name.trim().to_string(),
            PassEdit::SetDestination(d) => next.destination = normalize_destination(d.clone()),
            PassEdit::SetTimeOut(t) => next.time_out = *t,
            PassEdit::SetTimeIn(t) => next.time_in = Some(*t),
        }
    }
    if next.student_name.is_empty() {
        return Err(PassError::EmptyName);
    }
    if let Some(time_in) = next.time_in {
        if time_in < next.time_out {
            return Err(interval_error(&next, time_in));
        }
    }
    Ok(next)
}

/// Closed -> Open correction. Distinct and intentional; never a side effect of
/// `apply_edits`.
pub fn reopen(pass: &PassRow) -> PassRow {
    let mut next = pass.clone();
    next.time_in = None;
    next
}
