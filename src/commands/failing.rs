use std::io::{self, Write};

use anyhow::{Context, Result};
use datavalidation::store;

use crate::cli::FailingArgs;

pub fn run(args: FailingArgs) -> Result<i32> {
    let workspace = super::open_workspace(&args.db)?;
    let page = store::list_failing_records(
        &workspace.conn,
        args.validator_id,
        args.page,
        args.page_size,
    )
    .context("failed to list failing records")?;

    if args.json {
        super::write_json(&page)?;
        return Ok(0);
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(
        output,
        "Failing records: {} (page {} of {})",
        page.total,
        page.page,
        page.num_pages().max(1)
    )?;
    for row in &page.items {
        let mut flags = Vec::new();
        if row.is_exception {
            flags.push("exception");
        }
        if row.allowed_to_fail {
            flags.push("allowed to fail");
        }
        if !row.is_valid {
            flags.push("stale");
        }
        writeln!(
            output,
            "{}\tpk={}\t{}",
            row.validator,
            row.record_pk,
            if flags.is_empty() { "failing".to_string() } else { flags.join(", ") }
        )?;
        if !row.comment.is_empty() {
            writeln!(output, "\tcomment: {}", row.comment)?;
        }
        if !row.allowed_to_fail_justification.is_empty() {
            writeln!(output, "\tjustification: {}", row.allowed_to_fail_justification)?;
        }
    }
    output.flush()?;
    Ok(0)
}
