use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use tracing::info;

use super::ValidationOutcome;
use super::class::ClassMethodRunner;
use super::instance::InstanceMethodRunner;
use crate::error::{ConsistencyError, Result};
use crate::model::Model;
use crate::registry::{ModelEntry, Registry};
use crate::util::format_elapsed;

/// Validates one model. Single use: a second [`run`](Self::run) is a bug in
/// the caller.
pub struct ModelValidationRunner<'a, M: Model> {
    registry: &'a Registry,
    conn: &'a Connection,
    entry: &'a ModelEntry<M>,
    method_names: Vec<String>,
    validated: bool,
}

impl<'a, M: Model> ModelValidationRunner<'a, M> {
    /// `method_names` defaults to every validator of `M`; unknown names are
    /// rejected before anything runs.
    pub fn new(
        registry: &'a Registry,
        conn: &'a Connection,
        method_names: Option<Vec<String>>,
    ) -> Result<Self> {
        let entry = registry.entry::<M>()?;
        let method_names = match method_names {
            Some(names) => {
                entry.info.check_method_names(&names)?;
                names
            }
            None => entry.info.names().map(str::to_string).collect(),
        };
        Ok(Self {
            registry,
            conn,
            entry,
            method_names,
            validated: false,
        })
    }

    /// Outcomes come back in the order the names were requested.
    pub fn run(&mut self, show_progress: bool) -> Result<Vec<ValidationOutcome>> {
        if self.validated {
            return Err(ConsistencyError::AlreadyRun.into());
        }
        self.validated = true;
        info!(model = %self.entry.info, validators = self.method_names.len(), "running data validators");

        // class implementations win for whole-model runs
        let mut seen = HashSet::new();
        let (class_methods, instance_methods): (Vec<_>, Vec<_>) = self
            .method_names
            .iter()
            .filter(|name| seen.insert(name.as_str()))
            .filter_map(|name| self.entry.implementation(name))
            .partition(|implementation| implementation.class_method.is_some());

        let mut by_name: HashMap<String, ValidationOutcome> = HashMap::new();
        let class_outcomes = ClassMethodRunner::new(self.registry, self.conn, class_methods).run()?;
        let instance_outcomes =
            InstanceMethodRunner::new(self.registry, self.conn, instance_methods).run(show_progress)?;
        for (info, summary) in class_outcomes.into_iter().chain(instance_outcomes) {
            if let Some(elapsed) = summary.execution_time {
                info!(
                    validator = %info,
                    status = %summary.status(),
                    elapsed = %format_elapsed(elapsed),
                    "data validator finished"
                );
            }
            by_name.insert(info.method_name.clone(), (info, summary));
        }

        Ok(self
            .method_names
            .iter()
            .filter_map(|name| by_name.get(name).cloned())
            .collect())
    }
}
