use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use datavalidation::store::DEFAULT_PAGE_SIZE;

#[derive(Parser, Debug)]
#[command(
    name = "datavalidation",
    version,
    about = "Run data validators over the animal conference database and inspect the results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the demo tables and fill them with valid records.
    Seed(SeedArgs),
    /// Run data validators selected by label (all of them when none are given).
    Validate(ValidateArgs),
    /// List every validator with its latest status.
    Validators(ValidatorsArgs),
    /// Page through failing records.
    Failing(FailingArgs),
    /// Pin or unpin a failing record as allowed to fail.
    Allow(AllowArgs),
    /// Re-validate a single record.
    Object(ObjectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DbArgs {
    #[arg(long, default_value = ".cache/datavalidation/datavalidation.sqlite")]
    pub db_path: PathBuf,

    /// JSON settings file; DATAVALIDATION_* environment variables override it.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SeedArgs {
    #[command(flatten)]
    pub db: DbArgs,

    #[arg(long, default_value_t = 100)]
    pub animals: usize,

    #[arg(long, default_value_t = 20)]
    pub seminars: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub db: DbArgs,

    /// `app_label`, `app_label.ModelName` or `app_label.ModelName::validator`.
    pub labels: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub no_progress: bool,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ValidatorsArgs {
    #[command(flatten)]
    pub db: DbArgs,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FailingArgs {
    #[command(flatten)]
    pub db: DbArgs,

    #[arg(long)]
    pub validator_id: Option<i64>,

    #[arg(long, default_value_t = 1)]
    pub page: usize,

    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AllowArgs {
    #[command(flatten)]
    pub db: DbArgs,

    #[arg(long)]
    pub validator_id: i64,

    #[arg(long)]
    pub record_pk: i64,

    /// Clear the pin instead of setting it.
    #[arg(long, default_value_t = false)]
    pub unset: bool,

    #[arg(long)]
    pub justification: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ObjectArgs {
    #[command(flatten)]
    pub db: DbArgs,

    /// `app_label.ModelName`
    pub label: String,

    pub pk: i64,

    /// Skip re-running the class-only validators of the model.
    #[arg(long, default_value_t = false)]
    pub no_class_methods: bool,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}
