//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "heapscope",
    about = "Profile heap allocations of an unmodified program",
    after_help = "\
EXAMPLES:
    heapscope -- ./my-app --port 8080        Profile a program run
    heapscope -o app.json -- ./my-app        Choose the report path
    heapscope --summary -- ./my-app          Print top call sites afterwards
    heapscope --report app.json --top 20     Analyze an existing report"
)]
pub struct Args {
    /// Command to profile; everything after `--` is passed through verbatim
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Report output path (default: malloc_stats.json in the current directory)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Also profile child processes spawned by the target
    /// (each writes its own report, suffixed with its pid)
    #[arg(long)]
    pub profile_children: bool,

    /// Analyze an existing report instead of launching a target
    #[arg(long, value_name = "FILE", conflicts_with = "command")]
    pub report: Option<PathBuf>,

    /// Print a per-call-site summary after the target exits
    #[arg(long)]
    pub summary: bool,

    /// Number of call sites to show in summaries
    #[arg(long, default_value = "10", value_name = "N")]
    pub top: usize,

    /// Path to the preload runtime library (auto-detected if omitted)
    #[arg(long, value_name = "PATH")]
    pub runtime: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
