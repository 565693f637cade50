use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tracing::{debug, warn};

use super::{ValidationOutcome, call_guarded, handle_return_value, handle_summary};
use crate::error::Result;
use crate::model::{Model, ModelKey, RelatedLookups, iterate_records};
use crate::registry::{Implementation, Registry, ValidatorInfo};
use crate::results::{InstanceResult, SummaryEx};
use crate::store;
use crate::validator::InstanceMethod;

const PROGRESS_TEMPLATE: &str = "{msg} [{bar:40}] {pos}/{len} ({eta})";

struct Slot<M> {
    info: Arc<ValidatorInfo>,
    validator_id: i64,
    method: InstanceMethod<M>,
    summary: SummaryEx,
    finished: Option<SummaryEx>,
}

/// Streams every record of `M` through a set of instance methods.
pub(crate) struct InstanceMethodRunner<'a, M: Model> {
    registry: &'a Registry,
    conn: &'a Connection,
    implementations: Vec<&'a Implementation<M>>,
}

impl<'a, M: Model> InstanceMethodRunner<'a, M> {
    pub(crate) fn new(
        registry: &'a Registry,
        conn: &'a Connection,
        implementations: Vec<&'a Implementation<M>>,
    ) -> Self {
        Self {
            registry,
            conn,
            implementations,
        }
    }

    pub(crate) fn run(self, show_progress: bool) -> Result<Vec<ValidationOutcome>> {
        let mut slots = Vec::with_capacity(self.implementations.len());
        for implementation in &self.implementations {
            let Some(method) = implementation.instance_method else {
                continue;
            };
            let validator_id = self.registry.validator_id(self.conn, &implementation.info)?;
            // stale until seen failing again; pinned rows must survive the run
            store::invalidate_failures(self.conn, validator_id)?;
            slots.push(Slot {
                info: Arc::clone(&implementation.info),
                validator_id,
                method,
                summary: SummaryEx::new(),
                finished: None,
            });
        }
        if slots.is_empty() {
            return Ok(Vec::new());
        }

        let related = self.related_lookups();
        let progress = self.progress_bar(show_progress)?;
        let settings = self.registry.settings();

        for record in iterate_records::<M>(self.conn, &related, settings.chunk_size) {
            let record = record?;
            for slot in slots.iter_mut().filter(|slot| slot.finished.is_none()) {
                self.run_for_record(slot, &record)?;
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        for slot in &slots {
            let deleted = store::delete_stale_failures(self.conn, slot.validator_id)?;
            if deleted > 0 {
                debug!(validator = %slot.info, deleted, "removed stale failing records");
            }
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        for slot in slots {
            let summary = match slot.finished {
                Some(summary) => summary,
                None => handle_summary(self.conn, slot.validator_id, slot.summary)?,
            };
            outcomes.push((slot.info, summary));
        }
        Ok(outcomes)
    }

    fn run_for_record(&self, slot: &mut Slot<M>, record: &M) -> Result<()> {
        let started = Instant::now();
        let method = slot.method;
        let call = call_guarded(
            || method(record, self.conn),
            self.registry.settings().max_traceback_len,
        );
        let (result, allowed_to_fail) =
            handle_return_value(self.conn, slot.validator_id, record.pk(), call)?;
        slot.summary.add_execution_time(started.elapsed());

        match result {
            InstanceResult::Pass => slot.summary.record_pass(),
            InstanceResult::Na => slot.summary.record_na(),
            InstanceResult::Fail { .. } => slot.summary.record_failure(record.pk(), allowed_to_fail),
            InstanceResult::Exception(info) => {
                warn!(
                    validator = %slot.info,
                    pk = record.pk(),
                    error = %info.exc_type,
                    "data validator raised, skipping it for the remaining records"
                );
                let mut summary = SummaryEx::from_exception_info(info);
                summary.execution_time = slot.summary.execution_time;
                slot.finished = Some(handle_summary(self.conn, slot.validator_id, summary)?);
            }
        }
        Ok(())
    }

    /// Union of the hints of every validator in this run, minus the ones `M`
    /// cannot honour.
    fn related_lookups(&self) -> RelatedLookups {
        let model = ModelKey::of::<M>();
        let mut related = RelatedLookups::default();
        for implementation in &self.implementations {
            for path in &implementation.info.select_related {
                match RelatedLookups::check_select::<M>(path) {
                    Ok(()) => {
                        related.select_related.insert(path.clone());
                    }
                    Err(reason) => warn!(model = %model, validator = %implementation.info, "{reason}"),
                }
            }
            for path in &implementation.info.prefetch_related {
                match RelatedLookups::check_prefetch::<M>(path) {
                    Ok(()) => {
                        related.prefetch_related.insert(path.clone());
                    }
                    Err(reason) => warn!(model = %model, validator = %implementation.info, "{reason}"),
                }
            }
        }
        related
    }

    fn progress_bar(&self, show_progress: bool) -> Result<ProgressBar> {
        if !show_progress {
            return Ok(ProgressBar::hidden());
        }
        let total = M::count(self.conn)?;
        let bar = ProgressBar::new(u64::try_from(total).unwrap_or_default());
        match ProgressStyle::with_template(PROGRESS_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("=> ")),
            Err(err) => debug!(error = %err, "falling back to the default progress style"),
        }
        bar.set_message(ModelKey::of::<M>().label());
        Ok(bar)
    }
}
