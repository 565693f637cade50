use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, warn};

use super::call_guarded;
use super::class::ClassMethodRunner;
use super::handle_return_value;
use crate::error::Result;
use crate::model::{Model, ModelKey};
use crate::registry::{Implementation, ModelEntry, Registry};
use crate::results::{InstanceResult, Status};
use crate::store::{self, StatusUpdate};

/// Outcome tally of validating one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectCounts {
    pub model: ModelKey,
    pub pk: i64,
    pub passing: usize,
    pub failing: usize,
    pub exception: usize,
    pub warning: usize,
    pub uninitialized: usize,
}

impl ObjectCounts {
    fn new(model: ModelKey, pk: i64) -> Self {
        Self {
            model,
            pk,
            passing: 0,
            failing: 0,
            exception: 0,
            warning: 0,
            uninitialized: 0,
        }
    }

    fn add(&mut self, status: Status) {
        match status {
            Status::Passing => self.passing += 1,
            Status::Failing => self.failing += 1,
            Status::Exception => self.exception += 1,
            Status::Warning => self.warning += 1,
            Status::Uninitialized => self.uninitialized += 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failing == 0 && self.exception == 0
    }

    /// Message for whoever just saved the record, when it broke something.
    pub fn warning(&self) -> Option<String> {
        if self.is_clean() {
            return None;
        }
        let mut problems = Vec::new();
        if self.failing > 0 {
            problems.push(format!("failed {} data validator(s)", self.failing));
        }
        if self.exception > 0 {
            problems.push(format!(
                "raised an exception in {} data validator(s)",
                self.exception
            ));
        }
        Some(format!(
            "{} {} {}",
            self.model.model_name,
            self.pk,
            problems.join(" and ")
        ))
    }
}

/// Re-validates a single stored record, e.g. right after it was saved.
///
/// Instance implementations are used wherever they exist, including for
/// overloaded validators. Class-only validators can optionally be re-run for
/// the whole model in the same call.
pub struct ObjectValidationRunner<'a, M: Model> {
    registry: &'a Registry,
    conn: &'a Connection,
    entry: &'a ModelEntry<M>,
    record: &'a M,
}

impl<'a, M: Model> ObjectValidationRunner<'a, M> {
    pub fn new(registry: &'a Registry, conn: &'a Connection, record: &'a M) -> Result<Self> {
        Ok(Self {
            registry,
            conn,
            entry: registry.entry::<M>()?,
            record,
        })
    }

    pub fn run(&self, class_methods: bool) -> Result<ObjectCounts> {
        let pk = self.record.pk();
        let (instance_methods, class_only): (Vec<_>, Vec<_>) = self
            .entry
            .implementations
            .iter()
            .partition(|implementation| implementation.instance_method.is_some());

        let mut counts = ObjectCounts::new(self.entry.info.key.clone(), pk);
        for implementation in &instance_methods {
            let validator_id = self.registry.validator_id(self.conn, &implementation.info)?;
            let status = store::write(self.conn, |conn| {
                self.run_for_object(conn, implementation, validator_id)
            })?;
            counts.add(status);
        }

        if class_methods {
            let outcomes = ClassMethodRunner::new(self.registry, self.conn, class_only).run()?;
            for (_, summary) in &outcomes {
                counts.add(summary.status());
            }
        }

        if let Some(message) = counts.warning() {
            warn!(model = %counts.model, pk, "{message}");
        }
        Ok(counts)
    }

    /// Replace the record's failure row for one validator and re-derive the
    /// validator's status. Runs inside a single ledger write.
    fn run_for_object(
        &self,
        conn: &Connection,
        implementation: &Implementation<M>,
        validator_id: i64,
    ) -> Result<Status> {
        let Some(method) = implementation.instance_method else {
            return Ok(Status::Uninitialized);
        };
        let pk = self.record.pk();
        store::invalidate_record_failures(conn, validator_id, pk)?;
        let call = call_guarded(
            || method(self.record, conn),
            self.registry.settings().max_traceback_len,
        );
        let (result, allowed_to_fail) = handle_return_value(conn, validator_id, pk, call)?;
        store::delete_stale_record_failures(conn, validator_id, pk)?;

        let update = store::update_validator_for_object(
            conn,
            validator_id,
            implementation.info.is_overloaded(),
            &result,
        )?;
        match update {
            StatusUpdate::Changed(status) => {
                debug!(validator = %implementation.info, pk, %status, "validator status changed")
            }
            StatusUpdate::SkippedAmbiguous => debug!(
                validator = %implementation.info,
                pk,
                "status left for the next full run; overloaded validator has no recorded failures"
            ),
            StatusUpdate::Unchanged | StatusUpdate::SkippedException => {}
        }

        Ok(match result {
            InstanceResult::Pass | InstanceResult::Na => Status::Passing,
            InstanceResult::Fail { .. } if allowed_to_fail => Status::Passing,
            InstanceResult::Fail { .. } => Status::Failing,
            InstanceResult::Exception(_) => Status::Exception,
        })
    }
}
