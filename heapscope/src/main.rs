//! # heapscope - Main Entry Point
//!
//! Supports two operational modes:
//! - **Launch** (`heapscope [OPTIONS] -- <command> [args...]`): run a target
//!   under the profiling runtime and mirror its exit code
//! - **Analyze** (`heapscope --report stats.json`): summarize an existing
//!   report without running anything

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use heapscope::analysis;
use heapscope::cli::Args;
use heapscope::launch;
use heapscope::preflight::run_preflight_checks;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.to_string().to_lowercase().contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();

    // Analyze mode: no target involved.
    if let Some(report) = &args.report {
        let record = analysis::load_report(report)?;
        analysis::print_summary(&record, args.top);
        return Ok(EXIT_SUCCESS);
    }

    if args.command.is_empty() {
        bail!(
            "Missing required argument: COMMAND or --report\n\n\
             Usage:\n  \
             heapscope -- <command> [args...]     Profile a program run\n  \
             heapscope --report stats.json        Analyze an existing report\n\n\
             Run 'heapscope --help' for more options"
        );
    }

    let runtime = launch::find_runtime(args.runtime.as_deref())?;
    run_preflight_checks(&args.command[0], &runtime, args.quiet)?;

    let outcome = launch::run_target(&args, &runtime)?;

    if outcome.report_path.is_file() {
        if !args.quiet {
            info!("report written to {}", outcome.report_path.display());
        }
        if args.summary {
            let record = analysis::load_report(&outcome.report_path)?;
            analysis::print_summary(&record, args.top);
        }
    } else {
        // Target may have died before atexit handlers ran.
        eprintln!(
            "warning: no report at {} (target killed before exit handlers?)",
            outcome.report_path.display()
        );
    }

    Ok(outcome.exit_code)
}
