use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::error::ConsistencyError;
use crate::model::Model;
use crate::util::{tail_bounded, truncate_chars};

const MAX_EXC_TYPE_LEN: usize = 250;
const MAX_PRINTED_FAILURES: usize = 10;

const INSTANCE_RETURN_TYPE_ERROR: &str = "instance method data validators must return \
     ReturnValue::Pass, ReturnValue::Fail, ReturnValue::Na, true or false";
const CLASS_RETURN_TYPE_ERROR: &str = "class method data validators must return a Summary, \
     a boolean, or the failing records or ids";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Uninitialized,
    Passing,
    Failing,
    Exception,
    Warning,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Passing => "PASSING",
            Self::Failing => "FAILING",
            Self::Exception => "EXCEPTION",
            Self::Warning => "WARNING",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNINITIALIZED" => Some(Self::Uninitialized),
            "PASSING" => Some(Self::Passing),
            "FAILING" => Some(Self::Failing),
            "EXCEPTION" => Some(Self::Exception),
            "WARNING" => Some(Self::Warning),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Status::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("unknown validator status {text}").into()))
    }
}

/// What a validator hands back to the engine.
///
/// Instance methods return `Pass`, `Fail`, `Na` or a `Bool`; class methods
/// return a `Summary`, a `Bool` or the raw `Failures`. Anything else is
/// recorded as an exception with a type error.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    Pass,
    Fail {
        comment: Option<String>,
        allowed_to_fail: Option<bool>,
    },
    Na {
        comment: Option<String>,
    },
    Bool(bool),
    Summary(Summary),
    Failures(Failures),
    Nothing,
}

impl ReturnValue {
    pub fn fail(comment: impl Into<String>) -> Self {
        Self::Fail {
            comment: Some(comment.into()),
            allowed_to_fail: None,
        }
    }

    /// A failure the validator itself condones; the comment is stored as the
    /// justification.
    pub fn fail_allowed(justification: impl Into<String>) -> Self {
        Self::Fail {
            comment: Some(justification.into()),
            allowed_to_fail: Some(true),
        }
    }

    pub fn na() -> Self {
        Self::Na { comment: None }
    }
}

impl From<bool> for ReturnValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Summary> for ReturnValue {
    fn from(value: Summary) -> Self {
        Self::Summary(value)
    }
}

impl From<Failures> for ReturnValue {
    fn from(value: Failures) -> Self {
        Self::Failures(value)
    }
}

impl From<Vec<i64>> for ReturnValue {
    fn from(value: Vec<i64>) -> Self {
        Self::Failures(Failures::Ids(value))
    }
}

impl From<()> for ReturnValue {
    fn from(_: ()) -> Self {
        Self::Nothing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub pk: i64,
}

impl RecordRef {
    pub fn of<M: Model>(record: &M) -> Self {
        Self { pk: record.pk() }
    }
}

/// A query yielding failing primary keys in its first column.
#[derive(Debug, Clone, PartialEq)]
pub struct PkQuery {
    sql: String,
    params: Vec<Value>,
}

impl PkQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn fetch(&self, conn: &Connection) -> rusqlite::Result<Vec<i64>> {
        let mut statement = conn.prepare(&self.sql)?;
        let rows = statement.query_map(params_from_iter(self.params.iter()), |row| row.get(0))?;
        rows.collect()
    }
}

/// The failing records of a class-method run, in exactly one representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Failures {
    Ids(Vec<i64>),
    Records(Vec<RecordRef>),
    Query(PkQuery),
}

impl Default for Failures {
    fn default() -> Self {
        Self::Ids(Vec::new())
    }
}

impl Failures {
    pub fn records<'a, M: Model>(records: impl IntoIterator<Item = &'a M>) -> Self {
        Self::Records(records.into_iter().map(RecordRef::of).collect())
    }

    /// Run a lazy query so that only concrete ids remain.
    pub fn resolve(self, conn: &Connection) -> rusqlite::Result<Self> {
        match self {
            Self::Query(query) => Ok(Self::Ids(query.fetch(conn)?)),
            other => Ok(other),
        }
    }

    /// Canonical form: distinct ids in first-seen order.
    pub fn into_ids(self) -> Result<Vec<i64>, ConsistencyError> {
        let ids = match self {
            Self::Ids(ids) => ids,
            Self::Records(records) => records.into_iter().map(|record| record.pk).collect(),
            Self::Query(_) => return Err(ConsistencyError::UnresolvedQuery),
        };
        let mut seen = HashSet::with_capacity(ids.len());
        Ok(ids.into_iter().filter(|id| seen.insert(*id)).collect())
    }
}

/// Captured context of a validator that raised, panicked or returned
/// something the engine cannot interpret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub exc_type: String,
    pub traceback: Option<String>,
    pub exc_obj_pk: Option<i64>,
}

impl ExceptionInfo {
    pub fn from_error(err: &anyhow::Error, max_traceback_len: usize) -> Self {
        Self {
            exc_type: truncate_chars(&err.to_string(), Some(MAX_EXC_TYPE_LEN)),
            traceback: Some(tail_bounded(&format!("{err:?}"), max_traceback_len)),
            exc_obj_pk: None,
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send), max_traceback_len: usize) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self {
            exc_type: truncate_chars(&format!("panic: {message}"), Some(MAX_EXC_TYPE_LEN)),
            traceback: Some(tail_bounded(&message, max_traceback_len)),
            exc_obj_pk: None,
        }
    }

    pub fn type_error(message: &str) -> Self {
        Self {
            exc_type: format!("TypeError({message:?})"),
            traceback: None,
            exc_obj_pk: None,
        }
    }

    pub fn with_object(mut self, pk: i64) -> Self {
        self.exc_obj_pk = Some(pk);
        self
    }
}

/// The classified outcome of one instance method call on one record.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceResult {
    Pass,
    Fail {
        comment: Option<String>,
        allowed_to_fail: Option<bool>,
    },
    Na,
    Exception(ExceptionInfo),
}

/// Classify what an instance method produced for the record `pk`.
///
/// `Bool(true)` is a pass; only the explicit `Na` variant counts as not
/// applicable.
pub fn check_return_value(call: Result<ReturnValue, ExceptionInfo>, pk: i64) -> InstanceResult {
    match call {
        Err(info) => InstanceResult::Exception(info.with_object(pk)),
        Ok(ReturnValue::Pass | ReturnValue::Bool(true)) => InstanceResult::Pass,
        Ok(ReturnValue::Bool(false)) => InstanceResult::Fail {
            comment: None,
            allowed_to_fail: None,
        },
        Ok(ReturnValue::Fail {
            comment,
            allowed_to_fail,
        }) => InstanceResult::Fail {
            comment,
            allowed_to_fail,
        },
        Ok(ReturnValue::Na { .. }) => InstanceResult::Na,
        Ok(_) => InstanceResult::Exception(
            ExceptionInfo::type_error(INSTANCE_RETURN_TYPE_ERROR).with_object(pk),
        ),
    }
}

/// Aggregate result built by class-method validators.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub num_passing: Option<i64>,
    pub num_na: Option<i64>,
    pub failures: Failures,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            num_passing: Some(0),
            num_na: Some(0),
            failures: Failures::default(),
        }
    }
}

/// The engine's view of a validator run: counters, status and exception
/// details, as persisted onto the validator row.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEx {
    pub num_passing: Option<i64>,
    pub num_na: Option<i64>,
    pub failures: Option<Failures>,
    pub status: Option<Status>,
    pub num_allowed_to_fail: Option<i64>,
    pub exception_info: Option<ExceptionInfo>,
    pub execution_time: Option<Duration>,
}

impl Default for SummaryEx {
    fn default() -> Self {
        Self {
            num_passing: Some(0),
            num_na: Some(0),
            failures: Some(Failures::default()),
            status: None,
            num_allowed_to_fail: Some(0),
            exception_info: None,
            execution_time: Some(Duration::ZERO),
        }
    }
}

impl From<Summary> for SummaryEx {
    fn from(summary: Summary) -> Self {
        Self {
            num_passing: summary.num_passing,
            num_na: summary.num_na,
            failures: Some(summary.failures),
            ..Self::default()
        }
    }
}

impl SummaryEx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_exception_info(info: ExceptionInfo) -> Self {
        Self {
            exception_info: Some(info),
            ..Self::default()
        }
    }

    /// Interpret the value returned by a class method.
    pub fn from_return_value(value: ReturnValue) -> Self {
        match value {
            ReturnValue::Summary(summary) => summary.into(),
            ReturnValue::Pass | ReturnValue::Bool(true) => Self {
                num_passing: None,
                num_na: None,
                ..Self::default()
            },
            ReturnValue::Fail { .. } | ReturnValue::Bool(false) => Self {
                num_passing: None,
                num_na: None,
                failures: None,
                status: Some(Status::Failing),
                ..Self::default()
            },
            ReturnValue::Failures(failures) => Self {
                num_passing: None,
                num_na: None,
                failures: Some(failures),
                ..Self::default()
            },
            ReturnValue::Na { .. } | ReturnValue::Nothing => {
                Self::from_exception_info(ExceptionInfo::type_error(CLASS_RETURN_TYPE_ERROR))
            }
        }
    }

    pub fn resolve_failures(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        if let Some(failures) = self.failures.take() {
            self.failures = Some(failures.resolve(conn)?);
        }
        Ok(())
    }

    /// Replace the failures with their canonical id list and return it.
    pub fn normalize_failures(&mut self) -> Result<Option<&[i64]>, ConsistencyError> {
        let Some(failures) = self.failures.take() else {
            return Ok(None);
        };
        self.failures = Some(Failures::Ids(failures.into_ids()?));
        Ok(Some(self.failure_ids()))
    }

    /// Make the summary internally consistent and settle its status.
    ///
    /// An exception wipes every counter. Otherwise the status is PASSING
    /// exactly when every failure is allowed to fail; a status supplied up
    /// front must agree with that.
    pub fn complete(mut self) -> Result<Self, ConsistencyError> {
        if self.exception_info.is_some() {
            self.num_passing = None;
            self.num_na = None;
            self.num_allowed_to_fail = None;
            self.failures = None;
            self.status = Some(Status::Exception);
            return Ok(self);
        }

        let num_allowed_to_fail = self
            .num_allowed_to_fail
            .ok_or(ConsistencyError::MissingField("num_allowed_to_fail"))?;

        let computed = match self.normalize_failures()? {
            Some(ids) => {
                let uncondoned = (ids.len() as i64).saturating_sub(num_allowed_to_fail);
                Some(if uncondoned <= 0 {
                    Status::Passing
                } else {
                    Status::Failing
                })
            }
            None => None,
        };

        match (self.status, computed) {
            (None, Some(computed)) => self.status = Some(computed),
            (Some(given), Some(computed)) if given != computed => {
                return Err(ConsistencyError::StatusMismatch { given, computed });
            }
            (None, None) => return Err(ConsistencyError::MissingField("failures")),
            _ => {}
        }
        Ok(self)
    }

    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::Uninitialized)
    }

    pub fn failure_ids(&self) -> &[i64] {
        match &self.failures {
            Some(Failures::Ids(ids)) => ids,
            _ => &[],
        }
    }

    pub(crate) fn record_pass(&mut self) {
        bump(&mut self.num_passing);
    }

    pub(crate) fn record_na(&mut self) {
        bump(&mut self.num_na);
    }

    pub(crate) fn record_failure(&mut self, pk: i64, allowed_to_fail: bool) {
        match &mut self.failures {
            Some(Failures::Ids(ids)) => ids.push(pk),
            other => *other = Some(Failures::Ids(vec![pk])),
        }
        if allowed_to_fail {
            bump(&mut self.num_allowed_to_fail);
        }
    }

    pub(crate) fn add_execution_time(&mut self, elapsed: Duration) {
        if let Some(total) = self.execution_time.as_mut() {
            *total += elapsed;
        }
    }

    pub fn pretty_print(&self) -> String {
        let mut lines = Vec::new();
        match &self.exception_info {
            None => {
                if let Some(num_passing) = self.num_passing {
                    lines.push(format!("PASSED: {num_passing}"));
                }
                if let Some(failures) = &self.failures {
                    if let Failures::Ids(ids) = failures {
                        lines.push(format!("FAILED: {}", ids.len()));
                    }
                }
                if let Some(num_na) = self.num_na {
                    lines.push(format!("NA: {num_na}"));
                }
                if let Some(allowed) = self.num_allowed_to_fail.filter(|allowed| *allowed > 0) {
                    lines.push(format!("Allowed to Fail: {allowed}"));
                }
                let ids = self.failure_ids();
                if !ids.is_empty() {
                    let mut shown = ids
                        .iter()
                        .take(MAX_PRINTED_FAILURES)
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    if ids.len() > MAX_PRINTED_FAILURES {
                        shown.push_str("...");
                    }
                    lines.push(format!("Failing Ids: {shown}"));
                }
            }
            Some(info) => {
                let object = info
                    .exc_obj_pk
                    .map(|pk| format!(" (object pk={pk})"))
                    .unwrap_or_default();
                lines.push(format!("EXCEPTION: {}{object}", info.exc_type));
            }
        }
        lines.join("\n")
    }
}

fn bump(counter: &mut Option<i64>) {
    if let Some(value) = counter.as_mut() {
        *value += 1;
    }
}
