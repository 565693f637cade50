use std::sync::Arc;
use std::time::Instant;

use rusqlite::Connection;
use tracing::{debug, warn};

use super::{ValidationOutcome, call_guarded, handle_summary};
use crate::error::Result;
use crate::model::Model;
use crate::registry::{Implementation, Registry};
use crate::results::{ExceptionInfo, SummaryEx};
use crate::store;

/// Runs set-based class methods, each exactly once.
pub(crate) struct ClassMethodRunner<'a, M: Model> {
    registry: &'a Registry,
    conn: &'a Connection,
    implementations: Vec<&'a Implementation<M>>,
}

impl<'a, M: Model> ClassMethodRunner<'a, M> {
    pub(crate) fn new(
        registry: &'a Registry,
        conn: &'a Connection,
        implementations: Vec<&'a Implementation<M>>,
    ) -> Self {
        Self {
            registry,
            conn,
            implementations: implementations
                .into_iter()
                .filter(|implementation| implementation.class_method.is_some())
                .collect(),
        }
    }

    pub(crate) fn run(self) -> Result<Vec<ValidationOutcome>> {
        let mut validator_ids = Vec::with_capacity(self.implementations.len());
        for implementation in &self.implementations {
            let validator_id = self.registry.validator_id(self.conn, &implementation.info)?;
            store::invalidate_failures(self.conn, validator_id)?;
            validator_ids.push(validator_id);
        }

        let mut outcomes = Vec::with_capacity(self.implementations.len());
        for (implementation, validator_id) in self.implementations.iter().zip(&validator_ids) {
            let summary = self.run_validator(implementation, *validator_id)?;
            outcomes.push((Arc::clone(&implementation.info), summary));
        }

        for (implementation, validator_id) in self.implementations.iter().zip(&validator_ids) {
            let deleted = store::delete_stale_failures(self.conn, *validator_id)?;
            if deleted > 0 {
                debug!(validator = %implementation.info, deleted, "removed stale failing records");
            }
        }
        Ok(outcomes)
    }

    fn run_validator(
        &self,
        implementation: &Implementation<M>,
        validator_id: i64,
    ) -> Result<SummaryEx> {
        let Some(method) = implementation.class_method else {
            return Ok(SummaryEx::new());
        };
        let max_traceback_len = self.registry.settings().max_traceback_len;
        let started = Instant::now();

        let mut summary = match call_guarded(|| method(self.conn), max_traceback_len) {
            Ok(value) => SummaryEx::from_return_value(value),
            Err(info) => SummaryEx::from_exception_info(info),
        };
        if let Err(err) = summary.resolve_failures(self.conn) {
            let err = anyhow::Error::new(err).context("failed to resolve failing records query");
            summary = SummaryEx::from_exception_info(ExceptionInfo::from_error(
                &err,
                max_traceback_len,
            ));
        }

        if let Some(info) = &summary.exception_info {
            warn!(validator = %implementation.info, error = %info.exc_type, "data validator raised");
        }

        self.update_failing_records(validator_id, &mut summary)?;
        summary.execution_time = Some(started.elapsed());
        handle_summary(self.conn, validator_id, summary)
    }

    fn update_failing_records(&self, validator_id: i64, summary: &mut SummaryEx) -> Result<()> {
        let Some(record_pks) = summary.normalize_failures()? else {
            return Ok(());
        };
        for batch in record_pks.chunks(self.registry.settings().failure_batch_size.max(1)) {
            store::upsert_failure_batch(self.conn, validator_id, batch)?;
        }
        if !record_pks.is_empty() {
            summary.num_allowed_to_fail = Some(store::count_allowed_to_fail(self.conn, validator_id)?);
        }
        Ok(())
    }
}
