use thiserror::Error;

use crate::results::Status;

/// Raised while a registry is being built. These are bugs in the
/// application's validator declarations and are never recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("data validators on {owner} must have a non-empty name")]
    EmptyName { owner: String },

    #[error("cannot overload {owner}.{name} with an implementation named {other}")]
    NameMismatch {
        owner: String,
        name: String,
        other: String,
    },

    #[error("{owner}.{name} already has an instance method implementation")]
    DuplicateInstance { owner: String, name: String },

    #[error("{owner}.{name} already has a class method implementation")]
    DuplicateClass { owner: String, name: String },

    #[error(
        "{owner}.{name} is declared more than once; pair instance and class implementations with overload"
    )]
    DuplicateName { owner: String, name: String },
}

/// Raised when a caller asks for something the registry does not know about.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("no data validation methods on model {0}")]
    NotRegistered(String),

    #[error("{name} is not a data validator on {model}")]
    UnknownValidator { model: String, name: String },

    #[error("no models with data validators in app {0}")]
    UnknownApp(String),

    #[error(
        "validate expects labels of the form <app_label>, <app_label>.<model_name> or <app_label>.<model_name>::<validator_name>, got: {0}"
    )]
    InvalidLabel(String),

    #[error("the global registry has already been installed")]
    AlreadyInstalled,

    #[error("the global registry has not been installed")]
    NotInstalled,
}

/// Internal invariant violations. These point at a bug in the engine or in
/// the code driving it, never at a user validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("summary status {given} is inconsistent with its failures (computed {computed})")]
    StatusMismatch { given: Status, computed: Status },

    #[error("summary field {0} is missing")]
    MissingField(&'static str),

    #[error("lazy failure queries must be resolved before the summary is completed")]
    UnresolvedQuery,

    #[error("a ModelValidationRunner can only be run once")]
    AlreadyRun,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
