//! Data validation for records stored in SQLite.
//!
//! Record types implement [`Model`] and declare their checks with
//! [`DataValidator`]. A [`Registry`] built at startup catalogues them, and the
//! runners execute them and reconcile the outcomes into two ledger tables:
//! one row per validator with its latest status, and one row per record that
//! currently fails a validator.

pub mod config;
pub mod demo;
pub mod error;
pub mod model;
pub mod registry;
pub mod results;
pub mod runner;
pub mod store;
pub mod util;
pub mod validator;

pub use config::{ModelConfig, Settings};
pub use error::{ConsistencyError, DefinitionError, Error, Result, UsageError};
pub use model::{Model, ModelKey, RelatedLookups, Relation, iterate_records};
pub use registry::{ModelInfo, Registry, RegistryBuilder, Selection, ValidatorInfo};
pub use results::{
    ExceptionInfo, Failures, InstanceResult, PkQuery, RecordRef, ReturnValue, Status, Summary,
    SummaryEx, check_return_value,
};
pub use runner::{
    ModelValidationRunner, ObjectCounts, ObjectValidationRunner, RunReport, StatusTotals,
    ValidationOutcome, run_validation, validate_object,
};
pub use validator::DataValidator;
