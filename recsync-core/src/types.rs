//! Domain types for versioned-record synchronization.
//!
//! Everything persisted by the store or exchanged between the engine and its
//! collaborators is defined here. Status values are a closed enum with an
//! explicit storage mapping; no stringly-typed comparisons leave this module.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for a configured sync job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A primary or grouping key value read from a source table.
///
/// Integers order before text; within a variant the natural order applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Parse operator input: anything that reads as an `i64` is an integer key.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(n) => RecordKey::Int(n),
            Err(_) => RecordKey::Text(raw.to_owned()),
        }
    }
}

impl Ord for RecordKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (RecordKey::Int(a), RecordKey::Int(b)) => a.cmp(b),
            (RecordKey::Text(a), RecordKey::Text(b)) => a.cmp(b),
            (RecordKey::Int(_), RecordKey::Text(_)) => Ordering::Less,
            (RecordKey::Text(_), RecordKey::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for RecordKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(n) => n.fmt(f),
            RecordKey::Text(s) => s.fmt(f),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(n: i64) -> Self {
        RecordKey::Int(n)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        RecordKey::Text(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Per-row synchronization status.
///
/// Storage representation: `Pending` is `NULL`, every other variant is its
/// upper-case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
    Skipped,
    Superseded,
    Ignored,
}

impl SyncStatus {
    /// Value written to the status column; `None` means SQL `NULL`.
    pub fn as_db(self) -> Option<&'static str> {
        match self {
            SyncStatus::Pending => None,
            SyncStatus::Synced => Some("SYNCED"),
            SyncStatus::Failed => Some("FAILED"),
            SyncStatus::Skipped => Some("SKIPPED"),
            SyncStatus::Superseded => Some("SUPERSEDED"),
            SyncStatus::Ignored => Some("IGNORED"),
        }
    }

    /// Inverse of [`SyncStatus::as_db`]. Unknown text yields `None`.
    pub fn from_db(raw: Option<&str>) -> Option<Self> {
        let Some(raw) = raw else {
            return Some(SyncStatus::Pending);
        };
        match raw.trim().to_ascii_uppercase().as_str() {
            "" | "PENDING" => Some(SyncStatus::Pending),
            "SYNCED" => Some(SyncStatus::Synced),
            "FAILED" => Some(SyncStatus::Failed),
            "SKIPPED" => Some(SyncStatus::Skipped),
            "SUPERSEDED" => Some(SyncStatus::Superseded),
            "IGNORED" => Some(SyncStatus::Ignored),
            _ => None,
        }
    }

    /// Rows in these states are eligible for discovery.
    pub fn is_actionable(self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Skipped)
    }

    /// Outcomes that close a version group.
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncStatus::Synced | SyncStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        self.as_db().unwrap_or("PENDING")
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a work unit asks of the remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "CREATE"),
            Action::Update => write!(f, "UPDATE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records and work units
// ---------------------------------------------------------------------------

/// One version row of a logical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub primary_key: RecordKey,
    pub grouping_key: RecordKey,
    pub sequence: i64,
    pub status: SyncStatus,
    pub message: Option<String>,
    pub remote_id: Option<String>,
    /// Every column of the row, including the ones above, keyed by column name.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl VersionRecord {
    pub fn field(&self, column: &str) -> Option<&Value> {
        self.fields
            .get(column)
            .or_else(|| {
                self.fields
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(column))
                    .map(|(_, value)| value)
            })
            .filter(|value| !value.is_null())
    }
}

/// One discovered, actionable logical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub action: Action,
    pub representative: VersionRecord,
    /// Most recent valid remote id found anywhere in the group.
    pub remote_id: Option<String>,
    pub all_keys_in_group: Vec<RecordKey>,
}

impl WorkUnit {
    pub fn grouping_key(&self) -> &RecordKey {
        &self.representative.grouping_key
    }

    /// Human-readable identifier used in logs and audit details.
    pub fn label(&self) -> String {
        format!(
            "group '{}' (PK: {}, seq: {})",
            self.representative.grouping_key,
            self.representative.primary_key,
            self.representative.sequence
        )
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// When a job fires: daily at `hour:minute` UTC, or weekly when `day_of_week` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub hour: u8,
    #[serde(default)]
    pub minute: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<Weekday>,
}

impl Schedule {
    pub fn daily(hour: u8, minute: u8) -> Self {
        Self {
            hour,
            minute,
            day_of_week: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.hour < 24 && self.minute < 60
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(self.hour.into(), self.minute.into(), 0)
            .unwrap_or(NaiveTime::MIN);
        let mut date = after.date_naive();
        // A weekly schedule is always satisfied within eight calendar days.
        for _ in 0..8 {
            let candidate = Utc.from_utc_datetime(&date.and_time(time));
            let day_matches = self
                .day_of_week
                .map(|day| chrono::Datelike::weekday(&date) == day)
                .unwrap_or(true);
            if candidate > after && day_matches {
                return candidate;
            }
            match date.checked_add_days(Days::new(1)) {
                Some(next) => date = next,
                None => break,
            }
        }
        after
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.day_of_week {
            Some(day) => write!(f, "weekly on {day} at {:02}:{:02}", self.hour, self.minute),
            None => write!(f, "daily at {:02}:{:02}", self.hour, self.minute),
        }
    }
}

impl FromStr for Schedule {
    type Err = String;

    /// Accepts `HH:MM` or `<weekday> HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace().collect::<Vec<_>>();
        let day_of_week = match parts.len() {
            1 => None,
            2 => {
                let day = parts.remove(0);
                Some(
                    day.parse::<Weekday>()
                        .map_err(|_| format!("unknown weekday '{day}'"))?,
                )
            }
            _ => return Err(format!("expected 'HH:MM' or '<day> HH:MM', got '{s}'")),
        };
        let (hour, minute) = parts[0]
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got '{}'", parts[0]))?;
        let schedule = Schedule {
            hour: hour.parse().map_err(|_| format!("invalid hour '{hour}'"))?,
            minute: minute
                .parse()
                .map_err(|_| format!("invalid minute '{minute}'"))?,
            day_of_week,
        };
        if !schedule.is_valid() {
            return Err(format!("time out of range: '{s}'"));
        }
        Ok(schedule)
    }
}

/// Persisted state of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub name: String,
    pub schedule: Schedule,
    pub enabled: bool,
    pub is_running: bool,
    pub cancellation_requested: bool,
}

impl JobDescriptor {
    /// A fresh descriptor as seeded on first sighting of a job.
    pub fn new(job_id: JobId, name: impl Into<String>, schedule: Schedule, enabled: bool) -> Self {
        Self {
            job_id,
            name: name.into(),
            schedule,
            enabled,
            is_running: false,
            cancellation_requested: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Status of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Started,
    Success,
    Failure,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Started => "STARTED",
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Failure => "FAILURE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "STARTED" => Some(AuditStatus::Started),
            "SUCCESS" => Some(AuditStatus::Success),
            "FAILURE" => Some(AuditStatus::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only row of run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub status: AuditStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub details: Value,
}

impl AuditEntry {
    pub fn new(job_id: JobId, status: AuditStatus, message: impl Into<String>) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            status,
            message: message.into(),
            duration_seconds: None,
            details: Value::Null,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A local source-value to remote-id translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMapping {
    pub map_type: String,
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    pub remote_id: String,
}

/// Status breakdown of a versioned table.
///
/// Everything except `superseded` counts version groups by the status of
/// their newest row; `superseded` counts rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub groups: usize,
    pub pending: usize,
    pub skipped: usize,
    pub synced: usize,
    pub failed: usize,
    pub ignored: usize,
    pub superseded: usize,
}

impl TableStats {
    /// Add `count` groups whose newest row is in `status`.
    pub fn add_latest(&mut self, status: SyncStatus, count: usize) {
        self.groups += count;
        match status {
            SyncStatus::Pending => self.pending += count,
            SyncStatus::Skipped => self.skipped += count,
            SyncStatus::Synced => self.synced += count,
            SyncStatus::Failed => self.failed += count,
            SyncStatus::Ignored => self.ignored += count,
            SyncStatus::Superseded => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
