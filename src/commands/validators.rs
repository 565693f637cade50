use std::io::{self, Write};

use anyhow::{Context, Result};
use datavalidation::store::{self, ValidatorRow};

use crate::cli::ValidatorsArgs;

pub fn run(args: ValidatorsArgs) -> Result<i32> {
    let workspace = super::open_workspace(&args.db)?;
    workspace.registry.sync_to_storage(&workspace.conn)?;
    let rows = store::list_validators(&workspace.conn).context("failed to list validators")?;

    if args.json {
        super::write_json(&rows)?;
        return Ok(0);
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, "Validators: {}", rows.len())?;
    for row in &rows {
        write_row(&mut output, row)?;
    }
    output.flush()?;
    Ok(0)
}

fn write_row(output: &mut impl Write, row: &ValidatorRow) -> io::Result<()> {
    let last_run = row
        .last_run_time
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let kind = if row.is_class_method { "class" } else { "instance" };
    writeln!(
        output,
        "{}.\t{}\t{}\t{}\tlast run {}",
        row.id,
        row.label(),
        row.status,
        kind,
        last_run
    )?;
    writeln!(output, "\t{}", row.description)?;

    let counter = |value: Option<i64>| value.map_or_else(|| "-".to_string(), |value| value.to_string());
    writeln!(
        output,
        "\tpassing={} na={} failing={} allowed_to_fail={}",
        counter(row.num_passing),
        counter(row.num_na),
        row.num_failing,
        row.num_allowed_to_fail
    )?;
    if let Some(exc_type) = &row.exc_type {
        let object = row
            .exc_obj_pk
            .map(|pk| format!(" (object pk={pk})"))
            .unwrap_or_default();
        writeln!(output, "\texception: {exc_type}{object}")?;
    }
    Ok(())
}
