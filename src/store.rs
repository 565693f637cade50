//! SQLite persistence for the Validator and FailingRecord ledger.
//!
//! Every read-modify-write of a Validator row and every failure batch runs in
//! a `BEGIN IMMEDIATE` transaction, which takes SQLite's writer lock up front
//! and serialises concurrent runs against the same database. When the caller
//! already holds a transaction (a save hook, say) the write nests as a
//! savepoint inside it instead.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
};
use serde::Serialize;
use tracing::warn;

use crate::registry::ValidatorInfo;
use crate::results::{ExceptionInfo, InstanceResult, Status, SummaryEx};
use crate::util::{ensure_directory, now_utc_string};

const DB_SCHEMA_VERSION: &str = "1";
pub const DEFAULT_PAGE_SIZE: usize = 5;

const VALIDATOR_COLUMNS: &str = "
    v.id, v.app_label, v.model_name, v.method_name, v.description, v.is_class_method,
    v.status, v.last_run_time, v.execution_time, v.num_passing, v.num_na,
    v.exc_type, v.exc_traceback, v.exc_obj_pk,
    (SELECT COUNT(*) FROM datavalidation_failingrecord f
      WHERE f.validator_id = v.id AND f.allowed_to_fail = 0),
    (SELECT COUNT(*) FROM datavalidation_failingrecord f
      WHERE f.validator_id = v.id AND f.allowed_to_fail = 1)";

const FAILURE_COLUMNS: &str = "
    f.id, f.validator_id, v.app_label || '.' || v.model_name || '::' || v.method_name,
    f.record_pk, f.is_exception, f.comment, f.allowed_to_fail,
    f.allowed_to_fail_justification, f.is_valid";

/// Open (creating if needed) a file-backed ledger database.
pub fn open(path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }
    let conn =
        Connection::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    configure_connection(&conn)?;
    prepare(&conn).context("failed to initialize datavalidation schema")?;
    Ok(conn)
}

fn configure_connection(conn: &Connection) -> anyhow::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

/// Enable foreign keys and create the ledger tables.
pub fn prepare(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    ensure_schema(conn)
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS datavalidation_metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS datavalidation_validator (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          app_label TEXT NOT NULL,
          model_name TEXT NOT NULL,
          method_name TEXT NOT NULL,
          description TEXT NOT NULL DEFAULT '',
          is_class_method INTEGER NOT NULL DEFAULT 0,
          status TEXT NOT NULL DEFAULT 'UNINITIALIZED',
          last_run_time TEXT,
          execution_time REAL,
          num_passing INTEGER,
          num_na INTEGER,
          exc_type TEXT,
          exc_traceback TEXT,
          exc_obj_pk INTEGER,
          UNIQUE(app_label, model_name, method_name)
        );

        CREATE TABLE IF NOT EXISTS datavalidation_failingrecord (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          validator_id INTEGER NOT NULL,
          record_pk INTEGER NOT NULL,
          is_exception INTEGER NOT NULL DEFAULT 0,
          comment TEXT NOT NULL DEFAULT '',
          allowed_to_fail INTEGER NOT NULL DEFAULT 0,
          allowed_to_fail_justification TEXT NOT NULL DEFAULT '',
          is_valid INTEGER NOT NULL DEFAULT 1,
          UNIQUE(validator_id, record_pk),
          FOREIGN KEY(validator_id) REFERENCES datavalidation_validator(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_failingrecord_validator_valid
          ON datavalidation_failingrecord(validator_id, is_valid, allowed_to_fail);
        CREATE INDEX IF NOT EXISTS idx_failingrecord_record
          ON datavalidation_failingrecord(record_pk);
        ",
    )?;

    conn.execute(
        "INSERT INTO datavalidation_metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    conn.execute(
        "INSERT INTO datavalidation_metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now_utc_string()],
    )?;
    Ok(())
}

const WRITE_SAVEPOINT: &str = "datavalidation_write";

/// Run `body` atomically: in its own `BEGIN IMMEDIATE` transaction, or in a
/// savepoint when `conn` is already inside a transaction.
pub fn write<T, E>(conn: &Connection, body: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
where
    E: From<rusqlite::Error>,
{
    if conn.is_autocommit() {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let value = body(&*tx)?;
        tx.commit()?;
        return Ok(value);
    }

    conn.execute_batch(&format!("SAVEPOINT {WRITE_SAVEPOINT}"))?;
    match body(conn) {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE {WRITE_SAVEPOINT}"))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = conn.execute_batch(&format!(
                "ROLLBACK TO {WRITE_SAVEPOINT}; RELEASE {WRITE_SAVEPOINT}"
            )) {
                warn!(error = %rollback, "failed to roll back ledger savepoint");
            }
            Err(err)
        }
    }
}

/// Create the Validator row for `info` or refresh its description.
pub fn get_or_create_validator(conn: &Connection, info: &ValidatorInfo) -> rusqlite::Result<i64> {
    conn.query_row(
        "INSERT INTO datavalidation_validator
           (app_label, model_name, method_name, description, is_class_method)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(app_label, model_name, method_name) DO UPDATE SET
           description = excluded.description,
           is_class_method = excluded.is_class_method
         RETURNING id",
        params![
            info.model.app_label,
            info.model.model_name,
            info.method_name,
            info.description,
            info.has_class_method,
        ],
        |row| row.get(0),
    )
}

/// Mark every failure of a validator as stale without deleting it, so pinned
/// rows survive the run.
pub fn invalidate_failures(conn: &Connection, validator_id: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE datavalidation_failingrecord SET is_valid = 0 WHERE validator_id = ?1",
        [validator_id],
    )
}

pub fn invalidate_record_failures(
    conn: &Connection,
    validator_id: i64,
    record_pk: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE datavalidation_failingrecord SET is_valid = 0
         WHERE validator_id = ?1 AND record_pk = ?2",
        params![validator_id, record_pk],
    )
}

/// Stale rows nobody pinned.
pub fn delete_stale_failures(conn: &Connection, validator_id: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM datavalidation_failingrecord
         WHERE validator_id = ?1 AND is_valid = 0 AND allowed_to_fail = 0",
        [validator_id],
    )
}

pub fn delete_stale_record_failures(
    conn: &Connection,
    validator_id: i64,
    record_pk: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM datavalidation_failingrecord
         WHERE validator_id = ?1 AND record_pk = ?2 AND is_valid = 0 AND allowed_to_fail = 0",
        params![validator_id, record_pk],
    )
}

/// Field values written by one instance-level failure. `None` leaves the
/// stored value alone on update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureUpdate {
    pub is_exception: bool,
    pub comment: Option<String>,
    pub allowed_to_fail: Option<bool>,
    pub allowed_to_fail_justification: Option<String>,
}

impl FailureUpdate {
    /// Derive the row update from a classified instance result. Passing and
    /// not-applicable results write nothing.
    pub fn from_result(result: &InstanceResult) -> Option<Self> {
        match result {
            InstanceResult::Fail {
                comment,
                allowed_to_fail: Some(allowed),
            } => Some(Self {
                allowed_to_fail: Some(*allowed),
                allowed_to_fail_justification: comment.clone().filter(|text| !text.is_empty()),
                ..Self::default()
            }),
            InstanceResult::Fail {
                comment,
                allowed_to_fail: None,
            } => Some(Self {
                comment: comment.clone().filter(|text| !text.is_empty()),
                ..Self::default()
            }),
            InstanceResult::Exception(info) => Some(Self {
                is_exception: true,
                comment: Some(info.exc_type.clone()),
                ..Self::default()
            }),
            InstanceResult::Pass | InstanceResult::Na => None,
        }
    }
}

/// Upsert one failure and return its (possibly sticky) `allowed_to_fail`.
pub fn upsert_failure(
    conn: &Connection,
    validator_id: i64,
    record_pk: i64,
    update: &FailureUpdate,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "INSERT INTO datavalidation_failingrecord
           (validator_id, record_pk, is_exception, comment, allowed_to_fail,
            allowed_to_fail_justification, is_valid)
         VALUES (?1, ?2, ?3, COALESCE(?4, ''), COALESCE(?5, 0), COALESCE(?6, ''), 1)
         ON CONFLICT(validator_id, record_pk) DO UPDATE SET
           is_valid = 1,
           is_exception = excluded.is_exception,
           comment = COALESCE(?4, comment),
           allowed_to_fail = COALESCE(?5, allowed_to_fail),
           allowed_to_fail_justification = COALESCE(?6, allowed_to_fail_justification)
         RETURNING allowed_to_fail",
        params![
            validator_id,
            record_pk,
            update.is_exception,
            update.comment,
            update.allowed_to_fail,
            update.allowed_to_fail_justification,
        ],
        |row| row.get(0),
    )
}

/// Mark a batch of class-level failures valid, creating missing rows, in one
/// locked transaction.
pub fn upsert_failure_batch(
    conn: &Connection,
    validator_id: i64,
    record_pks: &[i64],
) -> rusqlite::Result<()> {
    write(conn, |conn| {
        let mut statement = conn.prepare_cached(
            "INSERT INTO datavalidation_failingrecord
               (validator_id, record_pk, is_exception, comment, is_valid)
             VALUES (?1, ?2, 0, '', 1)
             ON CONFLICT(validator_id, record_pk) DO UPDATE SET
               is_valid = 1, is_exception = 0, comment = ''",
        )?;
        for record_pk in record_pks {
            statement.execute(params![validator_id, record_pk])?;
        }
        Ok(())
    })
}

/// Current failures of a validator that are pinned as allowed to fail.
pub fn count_allowed_to_fail(conn: &Connection, validator_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM datavalidation_failingrecord
         WHERE validator_id = ?1 AND is_valid = 1 AND allowed_to_fail = 1",
        [validator_id],
        |row| row.get(0),
    )
}

/// Persist a completed run summary onto the Validator row.
pub fn save_summary(
    conn: &Connection,
    validator_id: i64,
    summary: &SummaryEx,
) -> rusqlite::Result<()> {
    let exception = summary.exception_info.as_ref();
    write(conn, |conn| {
        conn.execute(
            "UPDATE datavalidation_validator SET
               status = ?2, num_passing = ?3, num_na = ?4, last_run_time = ?5,
               execution_time = ?6, exc_type = ?7, exc_traceback = ?8, exc_obj_pk = ?9
             WHERE id = ?1",
            params![
                validator_id,
                summary.status(),
                summary.num_passing,
                summary.num_na,
                Utc::now(),
                summary.execution_time.map(|elapsed| elapsed.as_secs_f64()),
                exception.map(|info| info.exc_type.as_str()),
                exception.and_then(|info| info.traceback.as_deref()),
                exception.and_then(|info| info.exc_obj_pk),
            ],
        )?;
        Ok(())
    })
}

/// What a single-object result did to its Validator's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Unchanged,
    Changed(Status),
    /// The validator is in EXCEPTION; only a full run can clear it.
    SkippedException,
    /// Overloaded, no materialised failures and FAILING: the class
    /// implementation may know of failures this path never saw.
    SkippedAmbiguous,
}

/// Re-derive a Validator's status after one record was validated.
pub fn update_validator_for_object(
    conn: &Connection,
    validator_id: i64,
    overloaded: bool,
    result: &InstanceResult,
) -> rusqlite::Result<StatusUpdate> {
    write(conn, |tx| object_status_update(tx, validator_id, overloaded, result))
}

fn object_status_update(
    tx: &Connection,
    validator_id: i64,
    overloaded: bool,
    result: &InstanceResult,
) -> rusqlite::Result<StatusUpdate> {
    let current: Status = tx.query_row(
        "SELECT status FROM datavalidation_validator WHERE id = ?1",
        [validator_id],
        |row| row.get(0),
    )?;

    let update = if current == Status::Exception {
        StatusUpdate::SkippedException
    } else if let InstanceResult::Exception(info) = result {
        record_object_exception(tx, validator_id, info)?;
        StatusUpdate::Changed(Status::Exception)
    } else {
        let uncondoned: i64 = tx.query_row(
            "SELECT COUNT(*) FROM datavalidation_failingrecord
             WHERE validator_id = ?1 AND is_valid = 1 AND allowed_to_fail = 0",
            [validator_id],
            |row| row.get(0),
        )?;
        let next = if uncondoned == 0 {
            Status::Passing
        } else {
            Status::Failing
        };

        if overloaded && uncondoned == 0 && current == Status::Failing {
            StatusUpdate::SkippedAmbiguous
        } else if next == current {
            StatusUpdate::Unchanged
        } else {
            tx.execute(
                "UPDATE datavalidation_validator SET status = ?2 WHERE id = ?1",
                params![validator_id, next],
            )?;
            StatusUpdate::Changed(next)
        }
    };
    Ok(update)
}

fn record_object_exception(
    tx: &Connection,
    validator_id: i64,
    info: &ExceptionInfo,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE datavalidation_validator SET
           status = ?2, num_passing = NULL, num_na = NULL,
           exc_type = ?3, exc_traceback = ?4, exc_obj_pk = ?5
         WHERE id = ?1",
        params![
            validator_id,
            Status::Exception,
            info.exc_type,
            info.traceback,
            info.exc_obj_pk,
        ],
    )?;
    Ok(())
}

/// Pin or unpin a failure. Returns whether a row matched.
pub fn set_allowed_to_fail(
    conn: &Connection,
    validator_id: i64,
    record_pk: i64,
    allowed: bool,
    justification: Option<&str>,
) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE datavalidation_failingrecord SET
           allowed_to_fail = ?3,
           allowed_to_fail_justification = COALESCE(?4, allowed_to_fail_justification)
         WHERE validator_id = ?1 AND record_pk = ?2",
        params![validator_id, record_pk, allowed, justification],
    )?;
    Ok(updated > 0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatorRow {
    pub id: i64,
    pub app_label: String,
    pub model_name: String,
    pub method_name: String,
    pub description: String,
    pub is_class_method: bool,
    pub status: Status,
    pub last_run_time: Option<DateTime<Utc>>,
    pub execution_time: Option<f64>,
    pub num_passing: Option<i64>,
    pub num_na: Option<i64>,
    pub exc_type: Option<String>,
    pub exc_traceback: Option<String>,
    pub exc_obj_pk: Option<i64>,
    pub num_failing: i64,
    pub num_allowed_to_fail: i64,
}

impl ValidatorRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            app_label: row.get(1)?,
            model_name: row.get(2)?,
            method_name: row.get(3)?,
            description: row.get(4)?,
            is_class_method: row.get(5)?,
            status: row.get(6)?,
            last_run_time: row.get(7)?,
            execution_time: row.get(8)?,
            num_passing: row.get(9)?,
            num_na: row.get(10)?,
            exc_type: row.get(11)?,
            exc_traceback: row.get(12)?,
            exc_obj_pk: row.get(13)?,
            num_failing: row.get(14)?,
            num_allowed_to_fail: row.get(15)?,
        })
    }

    pub fn label(&self) -> String {
        format!("{}.{}::{}", self.app_label, self.model_name, self.method_name)
    }
}

pub fn list_validators(conn: &Connection) -> rusqlite::Result<Vec<ValidatorRow>> {
    let mut statement = conn.prepare(&format!(
        "SELECT {VALIDATOR_COLUMNS} FROM datavalidation_validator v
         ORDER BY v.app_label, v.model_name, v.method_name"
    ))?;
    let rows = statement.query_map([], ValidatorRow::from_row)?;
    rows.collect()
}

pub fn load_validator(conn: &Connection, validator_id: i64) -> rusqlite::Result<Option<ValidatorRow>> {
    conn.query_row(
        &format!("SELECT {VALIDATOR_COLUMNS} FROM datavalidation_validator v WHERE v.id = ?1"),
        [validator_id],
        ValidatorRow::from_row,
    )
    .optional()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailingRecordRow {
    pub id: i64,
    pub validator_id: i64,
    pub validator: String,
    pub record_pk: i64,
    pub is_exception: bool,
    pub comment: String,
    pub allowed_to_fail: bool,
    pub allowed_to_fail_justification: String,
    pub is_valid: bool,
}

impl FailingRecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            validator_id: row.get(1)?,
            validator: row.get(2)?,
            record_pk: row.get(3)?,
            is_exception: row.get(4)?,
            comment: row.get(5)?,
            allowed_to_fail: row.get(6)?,
            allowed_to_fail_justification: row.get(7)?,
            is_valid: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn num_pages(&self) -> usize {
        self.total.div_ceil(self.page_size.max(1))
    }
}

/// One page (1-based) of failing records, optionally for a single validator.
pub fn list_failing_records(
    conn: &Connection,
    validator_id: Option<i64>,
    page: usize,
    page_size: usize,
) -> rusqlite::Result<Page<FailingRecordRow>> {
    let page = page.max(1);
    let page_size = page_size.max(1);
    let offset = (page - 1).saturating_mul(page_size);

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM datavalidation_failingrecord
         WHERE ?1 IS NULL OR validator_id = ?1",
        [validator_id],
        |row| row.get(0),
    )?;

    let mut statement = conn.prepare(&format!(
        "SELECT {FAILURE_COLUMNS}
         FROM datavalidation_failingrecord f
         JOIN datavalidation_validator v ON v.id = f.validator_id
         WHERE ?1 IS NULL OR f.validator_id = ?1
         ORDER BY f.validator_id, f.record_pk
         LIMIT ?2 OFFSET ?3"
    ))?;
    let items = statement
        .query_map(
            params![validator_id, page_size as i64, offset as i64],
            FailingRecordRow::from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Page {
        items,
        page,
        page_size,
        total: usize::try_from(total).unwrap_or_default(),
    })
}

pub fn load_failure(
    conn: &Connection,
    validator_id: i64,
    record_pk: i64,
) -> rusqlite::Result<Option<FailingRecordRow>> {
    conn.query_row(
        &format!(
            "SELECT {FAILURE_COLUMNS}
             FROM datavalidation_failingrecord f
             JOIN datavalidation_validator v ON v.id = f.validator_id
             WHERE f.validator_id = ?1 AND f.record_pk = ?2"
        ),
        params![validator_id, record_pk],
        FailingRecordRow::from_row,
    )
    .optional()
}

/// Record pks with a current failure row, in pk order.
pub fn load_failing_pks(conn: &Connection, validator_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut statement = conn.prepare(
        "SELECT record_pk FROM datavalidation_failingrecord
         WHERE validator_id = ?1 AND is_valid = 1
         ORDER BY record_pk",
    )?;
    let rows = statement.query_map([validator_id], |row| row.get(0))?;
    rows.collect()
}
