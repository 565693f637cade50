use anyhow::{Context, Result};
use datavalidation::demo;
use tracing::info;

use crate::cli::SeedArgs;

pub fn run(args: SeedArgs) -> Result<i32> {
    let workspace = super::open_workspace(&args.db)?;
    let report = demo::seed(&workspace.conn, args.animals, args.seminars)
        .context("failed to seed the animal conference")?;
    info!(
        db_path = %args.db.db_path.display(),
        animals = report.animals,
        seminars = report.seminars,
        "seed complete"
    );
    Ok(0)
}
