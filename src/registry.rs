//! The catalogue of validators, built once at startup.
//!
//! Record types are listed explicitly with [`RegistryBuilder::model`]; nothing
//! is picked up as a side effect of loading code. [`RegistryBuilder::discover`]
//! turns the declared [`DataValidator`]s into immutable [`ValidatorInfo`]
//! descriptors. The registry can then be installed as the process-wide
//! instance with [`install`].

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, OnceLock, PoisonError, RwLock};

use regex::Regex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{DefinitionError, Result, UsageError};
use crate::model::{Model, ModelKey, RelatedLookups};
use crate::runner::object::{ObjectCounts, ObjectValidationRunner};
use crate::runner::{ModelValidationRunner, ValidationOutcome};
use crate::store;
use crate::util::{humanize_name, truncate_chars};
use crate::validator::{ClassMethod, DataValidator, InstanceMethod};

static LABEL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+)(?:\.(\w+)(?:::(\w+))?)?$").expect("label pattern is a valid regex")
});

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Immutable description of one validator, shared by runners and reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    pub model: ModelKey,
    pub method_name: String,
    pub description: String,
    pub select_related: BTreeSet<String>,
    pub prefetch_related: BTreeSet<String>,
    pub has_instance_method: bool,
    pub has_class_method: bool,
}

impl ValidatorInfo {
    pub fn is_overloaded(&self) -> bool {
        self.has_instance_method && self.has_class_method
    }
}

impl fmt::Display for ValidatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.model, self.method_name)
    }
}

/// The validators of one model, in declaration order.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub key: ModelKey,
    pub validators: Vec<Arc<ValidatorInfo>>,
}

impl ModelInfo {
    pub fn get(&self, name: &str) -> Option<&Arc<ValidatorInfo>> {
        self.validators
            .iter()
            .find(|validator| validator.method_name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.validators
            .iter()
            .map(|validator| validator.method_name.as_str())
    }

    pub fn check_method_names(&self, names: &[String]) -> Result<(), UsageError> {
        match names.iter().find(|name| self.get(name).is_none()) {
            Some(name) => Err(UsageError::UnknownValidator {
                model: self.key.label(),
                name: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}

pub(crate) struct Implementation<M> {
    pub(crate) info: Arc<ValidatorInfo>,
    pub(crate) instance_method: Option<InstanceMethod<M>>,
    pub(crate) class_method: Option<ClassMethod>,
}

/// The typed half of a registered model: descriptors plus the function
/// pointers that implement them.
pub(crate) struct ModelEntry<M> {
    pub(crate) info: ModelInfo,
    pub(crate) implementations: Vec<Implementation<M>>,
}

impl<M: Model> ModelEntry<M> {
    fn discover(settings: &Settings) -> Result<Option<Box<dyn RegisteredModel>>, DefinitionError> {
        let key = ModelKey::of::<M>();
        if M::config().exclude || settings.is_excluded(&key) {
            debug!(model = %key, "model excluded from data validation");
            return Ok(None);
        }

        let validators = M::data_validators()?;
        if validators.is_empty() {
            return Ok(None);
        }

        let mut seen = HashSet::new();
        let mut implementations = Vec::with_capacity(validators.len());
        for validator in validators {
            let implementation = build_implementation(&key, validator, settings)?;
            if !seen.insert(implementation.info.method_name.clone()) {
                return Err(DefinitionError::DuplicateName {
                    owner: key.label(),
                    name: implementation.info.method_name.clone(),
                });
            }
            implementations.push(implementation);
        }

        let info = ModelInfo {
            key,
            validators: implementations
                .iter()
                .map(|implementation| Arc::clone(&implementation.info))
                .collect(),
        };
        Ok(Some(Box::new(Self {
            info,
            implementations,
        })))
    }

    pub(crate) fn implementation(&self, name: &str) -> Option<&Implementation<M>> {
        self.implementations
            .iter()
            .find(|implementation| implementation.info.method_name == name)
    }
}

fn build_implementation<M: Model>(
    key: &ModelKey,
    validator: DataValidator<M>,
    settings: &Settings,
) -> Result<Implementation<M>, DefinitionError> {
    if validator.name.trim().is_empty() {
        return Err(DefinitionError::EmptyName { owner: key.label() });
    }

    let description = validator
        .doc
        .as_deref()
        .and_then(first_paragraph)
        .unwrap_or_else(|| humanize_name(&validator.name));

    let info = ValidatorInfo {
        model: key.clone(),
        description: truncate_chars(&description, settings.max_description_len),
        select_related: validator.select_related,
        prefetch_related: validator.prefetch_related,
        has_instance_method: validator.instance_method.is_some(),
        has_class_method: validator.class_method.is_some(),
        method_name: validator.name,
    };
    Ok(Implementation {
        info: Arc::new(info),
        instance_method: validator.instance_method,
        class_method: validator.class_method,
    })
}

/// First paragraph of a doc string with its whitespace collapsed.
fn first_paragraph(doc: &str) -> Option<String> {
    let mut words = Vec::new();
    for line in doc.trim().lines() {
        if line.trim().is_empty() {
            break;
        }
        words.extend(line.split_whitespace());
    }
    (!words.is_empty()).then(|| words.join(" "))
}

/// Object-safe face of a [`ModelEntry`], so one registry can hold every
/// record type.
pub(crate) trait RegisteredModel: Send + Sync {
    fn info(&self) -> &ModelInfo;

    fn as_any(&self) -> &dyn Any;

    fn run(
        &self,
        registry: &Registry,
        conn: &Connection,
        names: Option<&[String]>,
        show_progress: bool,
    ) -> Result<Vec<ValidationOutcome>>;

    fn validate_object(
        &self,
        registry: &Registry,
        conn: &Connection,
        pk: i64,
        class_methods: bool,
    ) -> Result<Option<ObjectCounts>>;
}

impl<M: Model> RegisteredModel for ModelEntry<M> {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn run(
        &self,
        registry: &Registry,
        conn: &Connection,
        names: Option<&[String]>,
        show_progress: bool,
    ) -> Result<Vec<ValidationOutcome>> {
        let mut runner =
            ModelValidationRunner::<M>::new(registry, conn, names.map(<[String]>::to_vec))?;
        runner.run(show_progress)
    }

    fn validate_object(
        &self,
        registry: &Registry,
        conn: &Connection,
        pk: i64,
        class_methods: bool,
    ) -> Result<Option<ObjectCounts>> {
        let Some(record) = M::get(conn, pk, &RelatedLookups::default())? else {
            return Ok(None);
        };
        let counts = ObjectValidationRunner::new(registry, conn, &record)?.run(class_methods)?;
        Ok(Some(counts))
    }
}

type Discover = fn(&Settings) -> Result<Option<Box<dyn RegisteredModel>>, DefinitionError>;

/// Lists the record types whose validators make up a [`Registry`].
pub struct RegistryBuilder {
    settings: Settings,
    models: Vec<(TypeId, Discover)>,
}

impl RegistryBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            models: Vec::new(),
        }
    }

    pub fn model<M: Model>(mut self) -> Self {
        let type_id = TypeId::of::<M>();
        if !self.models.iter().any(|(known, _)| *known == type_id) {
            self.models.push((type_id, ModelEntry::<M>::discover));
        }
        self
    }

    pub fn discover(self) -> Result<Registry, DefinitionError> {
        let mut models = Vec::new();
        let mut by_type = HashMap::new();
        for (type_id, discover) in self.models {
            if let Some(entry) = discover(&self.settings)? {
                by_type.insert(type_id, models.len());
                models.push(entry);
            }
        }

        info!(
            models = models.len(),
            validators = models
                .iter()
                .map(|model| model.info().validators.len())
                .sum::<usize>(),
            "data validators discovered"
        );

        Ok(Registry {
            settings: self.settings,
            models,
            by_type,
            validator_ids: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
        })
    }
}

/// Which validators of one model an operator asked for; `None` means all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub model: ModelKey,
    pub names: Option<Vec<String>>,
}

pub struct Registry {
    settings: Settings,
    models: Vec<Box<dyn RegisteredModel>>,
    by_type: HashMap<TypeId, usize>,
    validator_ids: RwLock<HashMap<(ModelKey, String), i64>>,
    synced: AtomicBool,
}

impl Registry {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelInfo> {
        self.models.iter().map(|model| model.info())
    }

    pub fn validators(&self) -> impl Iterator<Item = &Arc<ValidatorInfo>> {
        self.models().flat_map(|model| model.validators.iter())
    }

    pub fn lookup<M: Model>(&self) -> Result<&ModelInfo, UsageError> {
        self.by_type
            .get(&TypeId::of::<M>())
            .map(|index| self.models[*index].info())
            .ok_or_else(|| UsageError::NotRegistered(ModelKey::of::<M>().label()))
    }

    /// Look a model up by `app_label.model_name`, ignoring case.
    pub fn lookup_label(&self, label: &str) -> Result<&ModelInfo, UsageError> {
        self.registered_by_label(label).map(|model| model.info())
    }

    fn registered_by_label(&self, label: &str) -> Result<&dyn RegisteredModel, UsageError> {
        let (app_label, model_name) = label
            .split_once('.')
            .ok_or_else(|| UsageError::NotRegistered(label.to_string()))?;
        self.models
            .iter()
            .find(|model| model.info().key.matches(app_label, model_name))
            .map(|model| model.as_ref())
            .ok_or_else(|| UsageError::NotRegistered(label.to_string()))
    }

    pub(crate) fn registered(&self, key: &ModelKey) -> Result<&dyn RegisteredModel, UsageError> {
        self.registered_by_label(&key.label())
    }

    pub(crate) fn entry<M: Model>(&self) -> Result<&ModelEntry<M>, UsageError> {
        self.by_type
            .get(&TypeId::of::<M>())
            .and_then(|index| self.models[*index].as_any().downcast_ref::<ModelEntry<M>>())
            .ok_or_else(|| UsageError::NotRegistered(ModelKey::of::<M>().label()))
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Create or refresh the persistent Validator row of every descriptor.
    pub fn sync_to_storage(&self, conn: &Connection) -> Result<()> {
        let mut ids = self
            .validator_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for validator in self.validators() {
            let id = store::get_or_create_validator(conn, validator)?;
            ids.insert(
                (validator.model.clone(), validator.method_name.clone()),
                id,
            );
        }
        self.synced.store(true, Ordering::Release);
        info!(validators = ids.len(), "validators synced to storage");
        Ok(())
    }

    /// The Validator row id of `info`, creating the row on first use.
    pub fn validator_id(&self, conn: &Connection, info: &ValidatorInfo) -> Result<i64> {
        let key = (info.model.clone(), info.method_name.clone());
        if let Some(id) = self
            .validator_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(*id);
        }

        let id = store::get_or_create_validator(conn, info)?;
        self.validator_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, id);
        Ok(id)
    }

    /// Resolve an operator label: `app`, `app.Model` or `app.Model::validator`.
    pub fn select(&self, label: &str) -> Result<Vec<Selection>> {
        let captures = LABEL_PATTERN
            .captures(label.trim())
            .ok_or_else(|| UsageError::InvalidLabel(label.to_string()))?;
        let app_label = &captures[1];

        let Some(model_name) = captures.get(2) else {
            let selections: Vec<Selection> = self
                .models()
                .filter(|model| model.key.app_label.eq_ignore_ascii_case(app_label))
                .map(|model| Selection {
                    model: model.key.clone(),
                    names: None,
                })
                .collect();
            if selections.is_empty() {
                return Err(UsageError::UnknownApp(app_label.to_string()).into());
            }
            return Ok(selections);
        };

        let model = self.lookup_label(&format!("{app_label}.{}", model_name.as_str()))?;
        let names = match captures.get(3) {
            Some(name) => {
                let names = vec![name.as_str().to_string()];
                model.check_method_names(&names)?;
                Some(names)
            }
            None => None,
        };
        Ok(vec![Selection {
            model: model.key.clone(),
            names,
        }])
    }

    /// Resolve several labels, merging repeated models. No labels selects
    /// every registered model.
    pub fn select_all<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<Selection>> {
        if labels.is_empty() {
            return Ok(self
                .models()
                .map(|model| Selection {
                    model: model.key.clone(),
                    names: None,
                })
                .collect());
        }

        let mut merged: Vec<Selection> = Vec::new();
        for label in labels {
            for selection in self.select(label.as_ref())? {
                match merged
                    .iter_mut()
                    .find(|existing| existing.model == selection.model)
                {
                    Some(existing) => merge_names(&mut existing.names, selection.names),
                    None => merged.push(selection),
                }
            }
        }
        Ok(merged)
    }
}

fn merge_names(existing: &mut Option<Vec<String>>, incoming: Option<Vec<String>>) {
    match (existing.as_mut(), incoming) {
        (Some(names), Some(incoming)) => {
            for name in incoming {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        (Some(_), None) => *existing = None,
        (None, _) => {}
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("models", &self.models().collect::<Vec<_>>())
            .field("synced", &self.is_synced())
            .finish()
    }
}

/// Make `registry` the process-wide instance. Only the first call succeeds.
pub fn install(registry: Registry) -> Result<&'static Registry, UsageError> {
    let mut installed = false;
    let registry = GLOBAL.get_or_init(|| {
        installed = true;
        registry
    });
    if installed {
        Ok(registry)
    } else {
        Err(UsageError::AlreadyInstalled)
    }
}

pub fn global() -> Result<&'static Registry, UsageError> {
    GLOBAL.get().ok_or(UsageError::NotInstalled)
}
