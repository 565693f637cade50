use anyhow::{Context, Result, bail};
use datavalidation::store;
use tracing::info;

use crate::cli::AllowArgs;

pub fn run(args: AllowArgs) -> Result<i32> {
    let workspace = super::open_workspace(&args.db)?;
    let allowed = !args.unset;
    let updated = store::set_allowed_to_fail(
        &workspace.conn,
        args.validator_id,
        args.record_pk,
        allowed,
        args.justification.as_deref(),
    )
    .context("failed to update failing record")?;
    if !updated {
        bail!(
            "no failing record for validator {} and record {}",
            args.validator_id,
            args.record_pk
        );
    }

    info!(
        validator_id = args.validator_id,
        record_pk = args.record_pk,
        allowed_to_fail = allowed,
        "failing record updated; the validator status follows on its next run"
    );
    Ok(0)
}
