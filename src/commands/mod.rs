pub mod allow;
pub mod failing;
pub mod object;
pub mod seed;
pub mod validate;
pub mod validators;

use std::io::{self, Write};

use anyhow::{Context, Result};
use datavalidation::{Registry, Settings, demo, registry, store};
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::cli::DbArgs;

/// The installed registry plus an open ledger database with the demo tables.
pub(crate) struct Workspace {
    pub registry: &'static Registry,
    pub conn: Connection,
}

pub(crate) fn open_workspace(args: &DbArgs) -> Result<Workspace> {
    let settings = Settings::load(args.config.as_deref())?;
    let built = demo::registry(settings).context("invalid data validator declarations")?;
    let registry = registry::install(built)?;

    let conn = store::open(&args.db_path)?;
    demo::ensure_schema(&conn).context("failed to create animal conference tables")?;
    info!(
        db_path = %args.db_path.display(),
        models = registry.models().count(),
        "opened validation database"
    );
    Ok(Workspace { registry, conn })
}

pub(crate) fn write_json<T: Serialize>(value: &T) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, value).context("failed to serialize json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}
