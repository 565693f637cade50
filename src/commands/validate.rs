use std::io::{self, Write};

use anyhow::Result;
use datavalidation::util::format_elapsed;
use datavalidation::{
    ExceptionInfo, RunReport, Status, StatusTotals, SummaryEx, ValidatorInfo, run_validation,
};
use serde::Serialize;

use crate::cli::ValidateArgs;

#[derive(Debug, Serialize)]
struct ValidateResponse<'a> {
    validators: Vec<OutcomeJson<'a>>,
    totals: StatusTotals,
    elapsed_secs: f64,
    exit_code: i32,
}

#[derive(Debug, Serialize)]
struct OutcomeJson<'a> {
    validator: String,
    description: &'a str,
    status: Status,
    num_passing: Option<i64>,
    num_na: Option<i64>,
    num_allowed_to_fail: Option<i64>,
    failing_ids: &'a [i64],
    exception: Option<&'a ExceptionInfo>,
    execution_time_secs: Option<f64>,
}

pub fn run(args: ValidateArgs) -> Result<i32> {
    let workspace = super::open_workspace(&args.db)?;
    let selections = workspace.registry.select_all(&args.labels)?;
    let show_progress = !args.no_progress && !args.json;
    let report = run_validation(workspace.registry, &workspace.conn, &selections, show_progress)?;

    if args.json {
        super::write_json(&response(&report))?;
    } else {
        let mut output = io::BufWriter::new(io::stdout().lock());
        write_report(&mut output, &report)?;
        output.flush()?;
    }
    Ok(report.exit_code())
}

fn response(report: &RunReport) -> ValidateResponse<'_> {
    ValidateResponse {
        validators: report
            .outcomes()
            .map(|(info, summary)| OutcomeJson {
                validator: info.to_string(),
                description: &info.description,
                status: summary.status(),
                num_passing: summary.num_passing,
                num_na: summary.num_na,
                num_allowed_to_fail: summary.num_allowed_to_fail,
                failing_ids: summary.failure_ids(),
                exception: summary.exception_info.as_ref(),
                execution_time_secs: summary.execution_time.map(|elapsed| elapsed.as_secs_f64()),
            })
            .collect(),
        totals: report.totals(),
        elapsed_secs: report.elapsed.as_secs_f64(),
        exit_code: report.exit_code(),
    }
}

fn write_report(output: &mut impl Write, report: &RunReport) -> io::Result<()> {
    for model in &report.models {
        writeln!(output, "\nValidating {} ...", model.model)?;
        for (info, summary) in &model.outcomes {
            write_outcome(output, info, summary)?;
        }
    }

    let totals = report.totals();
    writeln!(
        output,
        "\nRan {} data validator(s) in {}",
        totals.total(),
        format_elapsed(report.elapsed)
    )?;
    writeln!(
        output,
        "PASSING: {}  FAILING: {}  EXCEPTION: {}  WARNING: {}  UNINITIALIZED: {}",
        totals.passing, totals.failing, totals.exception, totals.warning, totals.uninitialized
    )
}

fn write_outcome(output: &mut impl Write, info: &ValidatorInfo, summary: &SummaryEx) -> io::Result<()> {
    writeln!(output, "METHOD: {}: {}", info.method_name, summary.status())?;
    writeln!(output, "  \"{}\"", info.description)?;
    for line in summary.pretty_print().lines() {
        writeln!(output, "  {line}")?;
    }
    if let Some(elapsed) = summary.execution_time {
        writeln!(output, "  Execution time: {}", format_elapsed(elapsed))?;
    }
    Ok(())
}
