//! Executing validators and reconciling their results into the ledger.
//!
//! [`ModelValidationRunner`] validates one model, splitting its validators
//! between a [`class::ClassMethodRunner`] (set-based implementations run once)
//! and an [`instance::InstanceMethodRunner`] (every record streamed through
//! every validator). [`ObjectValidationRunner`] re-validates a single record.
//! [`run_validation`] drives several models from operator labels.

pub mod class;
pub mod instance;
pub mod model;
pub mod object;

#[cfg(test)]
mod tests;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::model::ModelKey;
use crate::registry::{Registry, Selection, ValidatorInfo};
use crate::results::{ExceptionInfo, InstanceResult, ReturnValue, Status, SummaryEx, check_return_value};
use crate::store::{self, FailureUpdate};

pub use model::ModelValidationRunner;
pub use object::{ObjectCounts, ObjectValidationRunner};

/// A validator paired with the completed summary of its run.
pub type ValidationOutcome = (Arc<ValidatorInfo>, SummaryEx);

/// Call a validator, turning an `Err` or a panic into [`ExceptionInfo`].
pub(crate) fn call_guarded(
    call: impl FnOnce() -> anyhow::Result<ReturnValue>,
    max_traceback_len: usize,
) -> Result<ReturnValue, ExceptionInfo> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ExceptionInfo::from_error(&err, max_traceback_len)),
        Err(payload) => Err(ExceptionInfo::from_panic(payload.as_ref(), max_traceback_len)),
    }
}

/// Classify one instance call and write its FailingRecord row if it failed.
///
/// Returns the result and whether the row is allowed to fail, which may be
/// a pin carried over from an earlier run.
pub(crate) fn handle_return_value(
    conn: &Connection,
    validator_id: i64,
    record_pk: i64,
    call: Result<ReturnValue, ExceptionInfo>,
) -> rusqlite::Result<(InstanceResult, bool)> {
    let result = check_return_value(call, record_pk);
    let allowed_to_fail = match FailureUpdate::from_result(&result) {
        Some(update) => store::upsert_failure(conn, validator_id, record_pk, &update)?,
        None => false,
    };
    Ok((result, allowed_to_fail))
}

/// Complete a summary and persist it onto the Validator row.
pub(crate) fn handle_summary(
    conn: &Connection,
    validator_id: i64,
    summary: SummaryEx,
) -> Result<SummaryEx> {
    let summary = summary.complete()?;
    store::save_summary(conn, validator_id, &summary)?;
    Ok(summary)
}

/// Validator statuses counted across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusTotals {
    pub passing: usize,
    pub failing: usize,
    pub exception: usize,
    pub warning: usize,
    pub uninitialized: usize,
}

impl StatusTotals {
    pub fn add(&mut self, status: Status) {
        match status {
            Status::Passing => self.passing += 1,
            Status::Failing => self.failing += 1,
            Status::Exception => self.exception += 1,
            Status::Warning => self.warning += 1,
            Status::Uninitialized => self.uninitialized += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.passing + self.failing + self.exception + self.warning + self.uninitialized
    }

    /// 0 when nothing failed or raised (including when nothing ran), else 1.
    pub fn exit_code(&self) -> i32 {
        if self.failing + self.exception == 0 { 0 } else { 1 }
    }
}

#[derive(Debug, Clone)]
pub struct ModelReport {
    pub model: ModelKey,
    pub outcomes: Vec<ValidationOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub models: Vec<ModelReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &ValidationOutcome> {
        self.models.iter().flat_map(|model| model.outcomes.iter())
    }

    pub fn totals(&self) -> StatusTotals {
        let mut totals = StatusTotals::default();
        for (_, summary) in self.outcomes() {
            totals.add(summary.status());
        }
        totals
    }

    pub fn exit_code(&self) -> i32 {
        self.totals().exit_code()
    }
}

/// Validate every selected model in order.
///
/// All selections are checked against the registry before anything runs, so
/// a bad label never leaves a run half done.
pub fn run_validation(
    registry: &Registry,
    conn: &Connection,
    selections: &[Selection],
    show_progress: bool,
) -> Result<RunReport> {
    let started = Instant::now();
    if !registry.is_synced() {
        registry.sync_to_storage(conn)?;
    }

    let mut targets = Vec::with_capacity(selections.len());
    for selection in selections {
        let model = registry.registered(&selection.model)?;
        if let Some(names) = &selection.names {
            model.info().check_method_names(names)?;
        }
        targets.push((model, selection.names.as_deref()));
    }

    let mut report = RunReport::default();
    for (model, names) in targets {
        let key = model.info().key.clone();
        info!(model = %key, "validating model");
        let outcomes = model.run(registry, conn, names, show_progress)?;
        report.models.push(ModelReport {
            model: key,
            outcomes,
        });
    }
    report.elapsed = started.elapsed();

    let totals = report.totals();
    info!(
        validators = totals.total(),
        passing = totals.passing,
        failing = totals.failing,
        exception = totals.exception,
        "validation finished"
    );
    Ok(report)
}

/// Validate one stored record of the model labelled `label`. `None` when no
/// record has that primary key.
pub fn validate_object(
    registry: &Registry,
    conn: &Connection,
    label: &str,
    pk: i64,
    class_methods: bool,
) -> Result<Option<ObjectCounts>> {
    let model = registry.registered(&registry.lookup_label(label)?.key)?;
    model.validate_object(registry, conn, pk, class_methods)
}
