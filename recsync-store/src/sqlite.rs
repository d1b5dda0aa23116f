//! `SQLite`-backed implementation of the storage traits.
//!
//! Uses a single `Mutex<Connection>` for thread safety. Source tables belong
//! to whatever application writes them; only the job, audit and mapping
//! tables are created here. Table and column names come from validated
//! config and are always double-quoted when spliced into SQL.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use recsync_core::{
    AuditEntry, AuditStatus, JobDescriptor, JobId, RecordKey, Schedule, SyncStatus, TableSpec,
    TableStats, ValueMapping, VersionRecord, WorkUnit,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{Map, Value};

use crate::backend::{AuditLog, JobStore, LockAttempt, MappingStore, RecordStore};
use crate::error::{self, StoreError};

/// Idempotent DDL for the application tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS job_config (
    job_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    is_enabled INTEGER NOT NULL DEFAULT 1,
    trigger_args TEXT NOT NULL,
    is_running INTEGER NOT NULL DEFAULT 0,
    cancellation_requested INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sync_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    duration_s REAL,
    details TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_log_job ON sync_log (job_id, id);

CREATE TABLE IF NOT EXISTS mapping (
    map_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    source_name TEXT,
    remote_id TEXT NOT NULL,
    PRIMARY KEY (map_type, source_id)
);
";

/// Message written to every non-representative row of a closed group.
pub const SUPERSEDED_MESSAGE: &str = "Superseded by a newer entry";

/// Keys per `IN (...)` list when fetching groups.
const IN_CHUNK: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str =
    "job_id, name, is_enabled, trigger_args, is_running, cancellation_requested";

/// `SQLite` storage for source tables and application state.
///
/// Create with [`SqliteStore::open`] for a database file shared with the
/// writing application, or [`SqliteStore::in_memory`] for tests.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path` and ensure the application tables.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory can't be created,
    /// or [`StoreError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] if the database can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run raw SQL; used to create and seed source tables in fixtures.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Sqlite`] on any statement failure.
    pub fn execute_batch(&self, sql: &str) -> error::Result<()> {
        self.lock_conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

// ---------------------------------------------------------------------------
// Value conversion
// ---------------------------------------------------------------------------

/// `"schema"."table"` quoting with embedded quotes doubled.
fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn key_param(key: &RecordKey) -> SqlValue {
    match key {
        RecordKey::Int(n) => SqlValue::Integer(*n),
        RecordKey::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn opt_text(value: Option<&str>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| SqlValue::Text(v.to_owned()))
}

fn limit_param(limit: usize) -> SqlValue {
    SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX))
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::from(n),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

fn json_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn column<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    fields.get(name).or_else(|| {
        fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

fn missing(spec: &TableSpec, column: &str) -> StoreError {
    StoreError::MissingValue {
        table: spec.table.clone(),
        column: column.to_owned(),
    }
}

fn record_key(spec: &TableSpec, fields: &Map<String, Value>, name: &str) -> error::Result<RecordKey> {
    match column(fields, name) {
        Some(Value::Number(n)) => n.as_i64().map(RecordKey::Int).ok_or_else(|| missing(spec, name)),
        Some(Value::String(s)) => Ok(RecordKey::Text(s.clone())),
        _ => Err(missing(spec, name)),
    }
}

fn to_record(spec: &TableSpec, fields: Map<String, Value>) -> error::Result<VersionRecord> {
    let primary_key = record_key(spec, &fields, &spec.primary_key)?;
    let grouping_key = record_key(spec, &fields, spec.grouping_key())?;
    let sequence = column(&fields, &spec.sequence)
        .and_then(Value::as_i64)
        .ok_or_else(|| missing(spec, &spec.sequence))?;

    let raw_status = column(&fields, &spec.status_column).and_then(json_to_string);
    let status = SyncStatus::from_db(raw_status.as_deref()).ok_or_else(|| {
        StoreError::UnknownStatus {
            table: spec.table.clone(),
            value: raw_status.clone().unwrap_or_default(),
        }
    })?;
    let message = column(&fields, &spec.message_column).and_then(json_to_string);
    let remote_id = column(&fields, &spec.remote_id).and_then(json_to_string);

    Ok(VersionRecord {
        primary_key,
        grouping_key,
        sequence,
        status,
        message,
        remote_id,
        fields,
    })
}

fn row_fields(row: &Row<'_>, names: &[String]) -> rusqlite::Result<Map<String, Value>> {
    let mut fields = Map::new();
    for (idx, name) in names.iter().enumerate() {
        fields.insert(name.clone(), json_value(row.get_ref(idx)?));
    }
    Ok(fields)
}

/// Run a `SELECT *` and decode every row of a versioned table.
fn query_records(
    conn: &Connection,
    spec: &TableSpec,
    sql: &str,
    params: &[SqlValue],
) -> error::Result<Vec<VersionRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(to_record(spec, row_fields(row, &names)?)?);
    }
    Ok(records)
}

/// Status predicate matching `Pending` (NULL or blank) and `Skipped` rows.
fn actionable_predicate(status: &str) -> String {
    format!(
        "({status} IS NULL OR TRIM({status}) = '' OR UPPER(TRIM({status})) IN ('PENDING', 'SKIPPED'))"
    )
}

/// Match one status, tolerant of case and padding. `Pending` also matches
/// NULL and blank.
fn status_is(column: &str, status: SyncStatus) -> String {
    match status {
        SyncStatus::Pending => format!(
            "({column} IS NULL OR TRIM({column}) = '' OR UPPER(TRIM({column})) = 'PENDING')"
        ),
        other => format!("UPPER(TRIM({column})) = '{}'", other.as_str()),
    }
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

impl RecordStore for SqliteStore {
    fn pending_group_keys(
        &self,
        spec: &TableSpec,
        limit: usize,
        watermark: Option<i64>,
    ) -> error::Result<Vec<RecordKey>> {
        let group = quote_ident(spec.grouping_key());
        let mut sql = format!(
            "SELECT DISTINCT {group} FROM {} WHERE {} AND {group} IS NOT NULL",
            quote_ident(&spec.table),
            actionable_predicate(&quote_ident(&spec.status_column)),
        );
        let mut params = Vec::new();
        if let Some(watermark) = watermark {
            sql.push_str(&format!(" AND {} >= ?", quote_ident(&spec.sequence)));
            params.push(SqlValue::Integer(watermark));
        }
        sql.push_str(&format!(" ORDER BY {group} LIMIT ?"));
        params.push(limit_param(limit));

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            match row.get_ref(0)? {
                ValueRef::Integer(n) => keys.push(RecordKey::Int(n)),
                ValueRef::Text(t) => keys.push(RecordKey::Text(String::from_utf8_lossy(t).into_owned())),
                other => tracing::warn!(
                    "{}: ignoring grouping key of unsupported type {:?}",
                    spec.table,
                    other.data_type()
                ),
            }
        }
        Ok(keys)
    }

    fn fetch_groups(
        &self,
        spec: &TableSpec,
        keys: &[RecordKey],
        watermark: Option<i64>,
    ) -> error::Result<Vec<VersionRecord>> {
        let conn = self.lock_conn()?;
        let mut records = Vec::new();
        for chunk in keys.chunks(IN_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut sql = format!(
                "SELECT * FROM {} WHERE {} IN ({placeholders})",
                quote_ident(&spec.table),
                quote_ident(spec.grouping_key()),
            );
            let mut params: Vec<SqlValue> = chunk.iter().map(key_param).collect();
            if let Some(watermark) = watermark {
                sql.push_str(&format!(" AND {} >= ?", quote_ident(&spec.sequence)));
                params.push(SqlValue::Integer(watermark));
            }
            records.extend(query_records(&conn, spec, &sql, &params)?);
        }
        Ok(records)
    }

    fn get_record(
        &self,
        spec: &TableSpec,
        key: &RecordKey,
    ) -> error::Result<Option<VersionRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? LIMIT 1",
            quote_ident(&spec.table),
            quote_ident(&spec.primary_key),
        );
        let conn = self.lock_conn()?;
        Ok(query_records(&conn, spec, &sql, &[key_param(key)])?.pop())
    }

    fn finalize(
        &self,
        spec: &TableSpec,
        unit: &WorkUnit,
        status: SyncStatus,
        remote_id: Option<&str>,
        message: Option<&str>,
    ) -> error::Result<usize> {
        let table = quote_ident(&spec.table);
        let pk = quote_ident(&spec.primary_key);
        let status_col = quote_ident(&spec.status_column);
        let message_col = quote_ident(&spec.message_column);
        let representative = key_param(&unit.representative.primary_key);

        let conn = self.lock_conn()?;
        let affected = match status {
            SyncStatus::Skipped => conn.execute(
                &format!("UPDATE {table} SET {status_col} = ?1, {message_col} = ?2 WHERE {pk} = ?3"),
                params![status.as_db(), message, representative],
            )?,
            SyncStatus::Synced | SyncStatus::Failed => {
                if unit.all_keys_in_group.is_empty() {
                    tracing::warn!("{}: {} has no group keys; nothing finalized", spec.table, unit.label());
                    return Ok(0);
                }
                let remote_col = quote_ident(&spec.remote_id);
                let placeholders = (0..unit.all_keys_in_group.len())
                    .map(|i| format!("?{}", i + 7))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {table} SET \
                     {status_col} = CASE WHEN {pk} = ?1 THEN ?2 ELSE ?4 END, \
                     {message_col} = CASE WHEN {pk} = ?1 THEN ?3 ELSE ?5 END, \
                     {remote_col} = CASE WHEN {pk} = ?1 THEN COALESCE(?6, {remote_col}) ELSE {remote_col} END \
                     WHERE {pk} IN ({placeholders})"
                );
                let mut values = vec![
                    representative,
                    opt_text(status.as_db()),
                    opt_text(message),
                    opt_text(SyncStatus::Superseded.as_db()),
                    SqlValue::Text(SUPERSEDED_MESSAGE.to_owned()),
                    opt_text(remote_id),
                ];
                values.extend(unit.all_keys_in_group.iter().map(key_param));
                conn.execute(&sql, params_from_iter(values.iter()))?
            }
            other => return Err(StoreError::InvalidFinalStatus(other)),
        };
        tracing::debug!("{}: finalize {} as {status}: {affected} row(s)", spec.table, unit.label());
        Ok(affected)
    }

    fn reset_to_pending(&self, spec: &TableSpec, key: &RecordKey) -> error::Result<usize> {
        let status = quote_ident(&spec.status_column);
        let sql = format!(
            "UPDATE {} SET {status} = NULL, {} = NULL WHERE {} = ?1 AND {}",
            quote_ident(&spec.table),
            quote_ident(&spec.message_column),
            quote_ident(&spec.primary_key),
            status_is(&status, SyncStatus::Failed),
        );
        Ok(self.lock_conn()?.execute(&sql, [key_param(key)])?)
    }

    fn mark_ignored(
        &self,
        spec: &TableSpec,
        key: &RecordKey,
        message: &str,
    ) -> error::Result<usize> {
        let status = quote_ident(&spec.status_column);
        let sql = format!(
            "UPDATE {} SET {status} = ?1, {} = ?2 WHERE {} = ?3 AND {}",
            quote_ident(&spec.table),
            quote_ident(&spec.message_column),
            quote_ident(&spec.primary_key),
            status_is(&status, SyncStatus::Skipped),
        );
        Ok(self.lock_conn()?.execute(
            &sql,
            params![SyncStatus::Ignored.as_db(), message, key_param(key)],
        )?)
    }

    fn table_stats(&self, spec: &TableSpec) -> error::Result<TableStats> {
        let table = quote_ident(&spec.table);
        let status = quote_ident(&spec.status_column);
        let latest = format!(
            "WITH latest AS ( \
               SELECT {status} AS status, ROW_NUMBER() OVER ( \
                 PARTITION BY {} ORDER BY {} DESC) AS rn \
               FROM {table}) \
             SELECT UPPER(TRIM(status)), COUNT(*) FROM latest WHERE rn = 1 \
             GROUP BY UPPER(TRIM(status))",
            quote_ident(spec.grouping_key()),
            quote_ident(&spec.sequence),
        );

        let conn = self.lock_conn()?;
        let mut stats = TableStats::default();
        let mut stmt = conn.prepare(&latest)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let raw: Option<String> = row.get(0)?;
            let count: i64 = row.get(1)?;
            let parsed = SyncStatus::from_db(raw.as_deref()).ok_or_else(|| StoreError::UnknownStatus {
                table: spec.table.clone(),
                value: raw.clone().unwrap_or_default(),
            })?;
            stats.add_latest(parsed, usize::try_from(count).unwrap_or(0));
        }

        let superseded: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {table} WHERE {}",
                status_is(&status, SyncStatus::Superseded)
            ),
            [],
            |row| row.get(0),
        )?;
        stats.superseded = usize::try_from(superseded).unwrap_or(0);
        Ok(stats)
    }

    fn records_with_status(
        &self,
        spec: &TableSpec,
        status: SyncStatus,
        limit: usize,
    ) -> error::Result<Vec<VersionRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {} DESC LIMIT ?",
            quote_ident(&spec.table),
            status_is(&quote_ident(&spec.status_column), status),
            quote_ident(&spec.sequence),
        );
        let conn = self.lock_conn()?;
        query_records(&conn, spec, &sql, &[limit_param(limit)])
    }

    fn latest_remote_id(
        &self,
        spec: &TableSpec,
        column: &str,
        key: &RecordKey,
    ) -> error::Result<Option<String>> {
        let remote = quote_ident(&spec.remote_id);
        let sql = format!(
            "SELECT {remote} FROM {} WHERE {} = ?1 AND {remote} IS NOT NULL ORDER BY {} DESC",
            quote_ident(&spec.table),
            quote_ident(column),
            quote_ident(&spec.sequence),
        );
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([key_param(key)])?;
        while let Some(row) = rows.next()? {
            if let Some(id) = json_to_string(&json_value(row.get_ref(0)?)) {
                if !spec.is_sentinel(&id) {
                    return Ok(Some(id.trim().to_owned()));
                }
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

struct JobRow {
    job_id: String,
    name: String,
    enabled: bool,
    trigger_args: String,
    is_running: bool,
    cancellation_requested: bool,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get(2)?,
            trigger_args: row.get(3)?,
            is_running: row.get(4)?,
            cancellation_requested: row.get(5)?,
        })
    }

    fn into_descriptor(self) -> error::Result<JobDescriptor> {
        let schedule: Schedule = serde_json::from_str(&self.trigger_args)?;
        Ok(JobDescriptor {
            job_id: JobId(self.job_id),
            name: self.name,
            schedule,
            enabled: self.enabled,
            is_running: self.is_running,
            cancellation_requested: self.cancellation_requested,
        })
    }
}

impl JobStore for SqliteStore {
    fn ensure_job(&self, job: &JobDescriptor) -> error::Result<bool> {
        let trigger_args = serde_json::to_string(&job.schedule)?;
        let conn = self.lock_conn()?;
        let created = conn.execute(
            "INSERT OR IGNORE INTO job_config (job_id, name, is_enabled, trigger_args) \
             VALUES (?1, ?2, ?3, ?4)",
            params![job.job_id.as_str(), job.name, job.enabled, trigger_args],
        )?;
        if created == 0 {
            conn.execute(
                "UPDATE job_config SET name = ?2 WHERE job_id = ?1",
                params![job.job_id.as_str(), job.name],
            )?;
        }
        Ok(created > 0)
    }

    fn get_job(&self, job_id: &JobId) -> error::Result<Option<JobDescriptor>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM job_config WHERE job_id = ?1"),
            [job_id.as_str()],
            JobRow::read,
        )
        .optional()?
        .map(JobRow::into_descriptor)
        .transpose()
    }

    fn list_jobs(&self) -> error::Result<Vec<JobDescriptor>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM job_config ORDER BY job_id"
        ))?;
        let rows = stmt.query_map([], JobRow::read)?;
        rows.map(|row| row.map_err(StoreError::from)?.into_descriptor())
            .collect()
    }

    fn set_enabled(&self, job_id: &JobId, enabled: bool) -> error::Result<bool> {
        let n = self.lock_conn()?.execute(
            "UPDATE job_config SET is_enabled = ?2 WHERE job_id = ?1",
            params![job_id.as_str(), enabled],
        )?;
        Ok(n > 0)
    }

    fn set_schedule(&self, job_id: &JobId, schedule: &Schedule) -> error::Result<bool> {
        let trigger_args = serde_json::to_string(schedule)?;
        let n = self.lock_conn()?.execute(
            "UPDATE job_config SET trigger_args = ?2 WHERE job_id = ?1",
            params![job_id.as_str(), trigger_args],
        )?;
        Ok(n > 0)
    }

    fn try_acquire(&self, job_id: &JobId) -> error::Result<LockAttempt> {
        let mut conn = self.lock_conn()?;
        // IMMEDIATE takes the write lock up front so two processes cannot
        // both observe "nothing running".
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let blocking: Option<String> = tx
            .query_row(
                "SELECT job_id FROM job_config WHERE is_running = 1 ORDER BY job_id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(by) = blocking {
            return Ok(LockAttempt::Blocked { by: JobId(by) });
        }
        let updated = tx.execute(
            "UPDATE job_config SET is_running = 1, cancellation_requested = 0 WHERE job_id = ?1",
            [job_id.as_str()],
        )?;
        if updated == 0 {
            return Ok(LockAttempt::UnknownJob);
        }
        tx.commit()?;
        Ok(LockAttempt::Acquired)
    }

    fn release(&self, job_id: &JobId) -> error::Result<()> {
        self.lock_conn()?.execute(
            "UPDATE job_config SET is_running = 0, cancellation_requested = 0 WHERE job_id = ?1",
            [job_id.as_str()],
        )?;
        Ok(())
    }

    fn request_cancel(&self, job_id: &JobId) -> error::Result<bool> {
        let n = self.lock_conn()?.execute(
            "UPDATE job_config SET cancellation_requested = 1 WHERE job_id = ?1 AND is_running = 1",
            [job_id.as_str()],
        )?;
        Ok(n > 0)
    }

    fn cancellation_requested(&self, job_id: &JobId) -> error::Result<bool> {
        let flag: Option<bool> = self
            .lock_conn()?
            .query_row(
                "SELECT cancellation_requested FROM job_config WHERE job_id = ?1",
                [job_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    fn reset_all_locks(&self) -> error::Result<usize> {
        Ok(self.lock_conn()?.execute(
            "UPDATE job_config SET is_running = 0, cancellation_requested = 0 \
             WHERE is_running = 1 OR cancellation_requested = 1",
            [],
        )?)
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

type AuditRow = (String, String, String, String, Option<f64>, Option<String>);

fn audit_entry((job_id, ts, status, message, duration, details): AuditRow) -> error::Result<AuditEntry> {
    let timestamp = DateTime::parse_from_rfc3339(&ts)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(ts.clone()))?;
    let status = AuditStatus::parse(&status).ok_or_else(|| StoreError::UnknownStatus {
        table: "sync_log".to_owned(),
        value: status.clone(),
    })?;
    let details = match details {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Value::Null,
    };
    Ok(AuditEntry {
        job_id: JobId(job_id),
        timestamp,
        status,
        message,
        duration_seconds: duration,
        details,
    })
}

impl AuditLog for SqliteStore {
    fn append(&self, entry: &AuditEntry) -> error::Result<i64> {
        let details = if entry.details.is_null() {
            None
        } else {
            Some(serde_json::to_string(&entry.details)?)
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sync_log (job_id, timestamp, status, message, duration_s, details) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.job_id.as_str(),
                entry.timestamp.to_rfc3339(),
                entry.status.as_str(),
                entry.message,
                entry.duration_seconds,
                details,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn recent(&self, job_id: Option<&JobId>, limit: usize) -> error::Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT job_id, timestamp, status, message, duration_s, details FROM sync_log",
        );
        let mut params = Vec::new();
        if let Some(job_id) = job_id {
            sql.push_str(" WHERE job_id = ?");
            params.push(SqlValue::Text(job_id.as_str().to_owned()));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        params.push(limit_param(limit));

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| -> rusqlite::Result<AuditRow> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?;
        rows.map(|row| audit_entry(row?)).collect()
    }
}

// ---------------------------------------------------------------------------
// MappingStore
// ---------------------------------------------------------------------------

fn read_mapping(row: &Row<'_>) -> rusqlite::Result<ValueMapping> {
    Ok(ValueMapping {
        map_type: row.get(0)?,
        source_id: row.get(1)?,
        source_name: row.get(2)?,
        remote_id: row.get(3)?,
    })
}

impl MappingStore for SqliteStore {
    fn get_mapping(&self, map_type: &str, source_id: &str) -> error::Result<Option<ValueMapping>> {
        Ok(self
            .lock_conn()?
            .query_row(
                "SELECT map_type, source_id, source_name, remote_id FROM mapping \
                 WHERE map_type = ?1 AND source_id = ?2",
                [map_type, source_id],
                read_mapping,
            )
            .optional()?)
    }

    fn upsert_mapping(&self, mapping: &ValueMapping) -> error::Result<()> {
        self.lock_conn()?.execute(
            "INSERT INTO mapping (map_type, source_id, source_name, remote_id) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(map_type, source_id) \
             DO UPDATE SET source_name = excluded.source_name, remote_id = excluded.remote_id",
            params![
                mapping.map_type,
                mapping.source_id,
                mapping.source_name,
                mapping.remote_id
            ],
        )?;
        Ok(())
    }

    fn list_mappings(&self, map_type: Option<&str>) -> error::Result<Vec<ValueMapping>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT map_type, source_id, source_name, remote_id FROM mapping \
             WHERE ?1 IS NULL OR map_type = ?1 ORDER BY map_type, source_id",
        )?;
        let rows = stmt.query_map([map_type], read_mapping)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
