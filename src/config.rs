use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::model::ModelKey;

pub const DEFAULT_CHUNK_SIZE: usize = 2000;
pub const DEFAULT_FAILURE_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_TRACEBACK_LEN: usize = 2000;

pub const MAX_DESCRIPTION_LEN_ENV: &str = "DATAVALIDATION_MAX_DESCRIPTION_LEN";
pub const CHUNK_SIZE_ENV: &str = "DATAVALIDATION_CHUNK_SIZE";

/// Process-wide settings read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Upper bound on validator descriptions; `None` keeps them whole.
    pub max_description_len: Option<usize>,
    pub max_traceback_len: usize,
    /// Records fetched per query while streaming a model.
    pub chunk_size: usize,
    /// Failure ids upserted per transaction by class-method validators.
    pub failure_batch_size: usize,
    /// Model labels (`app_label.model_name`) left out of discovery.
    pub exclude: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_description_len: None,
            max_traceback_len: DEFAULT_MAX_TRACEBACK_LEN,
            chunk_size: DEFAULT_CHUNK_SIZE,
            failure_batch_size: DEFAULT_FAILURE_BATCH_SIZE,
            exclude: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        settings.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let settings: Self = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        settings.validated()
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(MAX_DESCRIPTION_LEN_ENV) {
            let value = raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{MAX_DESCRIPTION_LEN_ENV} must be an integer: {raw}"))?;
            self.max_description_len = Some(value);
        }
        if let Some(raw) = lookup(CHUNK_SIZE_ENV) {
            self.chunk_size = raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{CHUNK_SIZE_ENV} must be an integer: {raw}"))?;
        }
        self.validated()
    }

    pub fn is_excluded(&self, key: &ModelKey) -> bool {
        let label = key.label();
        self.exclude
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(&label))
    }

    fn validated(self) -> Result<Self> {
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        if self.failure_batch_size == 0 {
            bail!("failure_batch_size must be greater than zero");
        }
        Ok(self)
    }
}

/// Options a model declares about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelConfig {
    /// Keep the model out of the registry and out of every run.
    pub exclude: bool,
}
