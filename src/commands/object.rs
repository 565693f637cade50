use std::io::{self, Write};

use anyhow::{Result, bail};
use datavalidation::validate_object;

use crate::cli::ObjectArgs;

pub fn run(args: ObjectArgs) -> Result<i32> {
    let workspace = super::open_workspace(&args.db)?;
    let Some(counts) = validate_object(
        workspace.registry,
        &workspace.conn,
        &args.label,
        args.pk,
        !args.no_class_methods,
    )?
    else {
        bail!("{} has no record with pk {}", args.label, args.pk);
    };

    if args.json {
        super::write_json(&counts)?;
    } else {
        let mut output = io::BufWriter::new(io::stdout().lock());
        writeln!(
            output,
            "{} {}: {} passing, {} failing, {} exception(s)",
            counts.model, counts.pk, counts.passing, counts.failing, counts.exception
        )?;
        if let Some(warning) = counts.warning() {
            writeln!(output, "WARNING: {warning}")?;
        }
        output.flush()?;
    }
    Ok(if counts.is_clean() { 0 } else { 1 })
}
