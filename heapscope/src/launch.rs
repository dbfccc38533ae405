//! Target process supervision.
//!
//! Builds the profiling environment (LD_PRELOAD plus the `HEAPSCOPE_*`
//! contract variables), spawns the target, and mirrors its exit status so
//! heapscope is transparent in scripts and CI pipelines.

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use heapscope_common::env::{DEFAULT_OUT, ENV_OUT, ENV_PROFILE_CHILDREN};

use crate::cli::Args;

/// File name of the injectable runtime library.
pub const RUNTIME_SO: &str = "libheapscope_preload.so";

/// Result of a supervised target run.
pub struct Outcome {
    /// Exit code to mirror (128 + signal number for signal deaths).
    pub exit_code: i32,
    /// Where the runtime was told to write the report.
    pub report_path: PathBuf,
}

/// Locate the preload library: an explicit `--runtime` path, or next to our
/// own executable (where a normal installation places it).
pub fn find_runtime(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return std::fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve runtime library path: {}", path.display()));
    }

    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let candidates = exe.parent().into_iter().flat_map(|dir| {
        [dir.join(RUNTIME_SO), dir.join("../lib").join(RUNTIME_SO)]
    });
    for candidate in candidates {
        if candidate.is_file() {
            return std::fs::canonicalize(&candidate).with_context(|| {
                format!("Failed to resolve runtime library path: {}", candidate.display())
            });
        }
    }

    bail!(
        "Could not find {RUNTIME_SO} next to the heapscope executable.\n\n\
         Pass its location explicitly:\n  \
         heapscope --runtime /path/to/{RUNTIME_SO} -- <command>"
    )
}

/// The report path the runtime will use, made absolute against `cwd` so the
/// target's own working-directory changes cannot move the report.
pub fn resolve_report_path(output: Option<&Path>, cwd: &Path) -> PathBuf {
    let path = output.unwrap_or_else(|| Path::new(DEFAULT_OUT));
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Compute the environment additions for a profiled run. `existing_preload`
/// is the inherited `LD_PRELOAD` value, which must be kept; the dynamic
/// loader accepts a colon-separated list.
pub fn profiling_env(
    runtime: &Path,
    report_path: &Path,
    profile_children: bool,
    existing_preload: Option<&str>,
) -> Vec<(OsString, OsString)> {
    let mut preload = OsString::from(runtime);
    if let Some(existing) = existing_preload {
        if !existing.is_empty() {
            preload.push(":");
            preload.push(existing);
        }
    }

    let mut env = vec![
        (OsString::from("LD_PRELOAD"), preload),
        (OsString::from(ENV_OUT), OsString::from(report_path)),
    ];
    if profile_children {
        env.push((OsString::from(ENV_PROFILE_CHILDREN), OsString::from("1")));
    }
    env
}

/// Spawn the target under the profiler and wait for it.
pub fn run_target(args: &Args, runtime: &Path) -> Result<Outcome> {
    let (program, target_args) = args
        .command
        .split_first()
        .context("Missing required argument: COMMAND")?;

    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let report_path = resolve_report_path(args.output.as_deref(), &cwd);

    let existing_preload = std::env::var("LD_PRELOAD").ok();
    let env = profiling_env(
        runtime,
        &report_path,
        args.profile_children,
        existing_preload.as_deref(),
    );

    log::info!("launching {program} under {}", runtime.display());
    let mut command = Command::new(program);
    command.args(target_args);
    for (key, value) in env {
        command.env(key, value);
    }

    let status = command
        .status()
        .with_context(|| format!("Failed to launch target: {program}"))?;

    let exit_code = match status.code() {
        Some(code) => code,
        // Mirror signal deaths the way shells do.
        None => 128 + status.signal().unwrap_or(0),
    };
    Ok(Outcome { exit_code, report_path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_path_made_absolute() {
        let cwd = Path::new("/work");
        assert_eq!(resolve_report_path(None, cwd), PathBuf::from("/work/malloc_stats.json"));
        assert_eq!(
            resolve_report_path(Some(Path::new("out/r.json")), cwd),
            PathBuf::from("/work/out/r.json")
        );
        assert_eq!(
            resolve_report_path(Some(Path::new("/tmp/r.json")), cwd),
            PathBuf::from("/tmp/r.json")
        );
    }

    #[test]
    fn test_profiling_env_prepends_to_ld_preload() {
        let env = profiling_env(
            Path::new("/lib/libheapscope_preload.so"),
            Path::new("/work/r.json"),
            false,
            Some("/lib/other.so"),
        );
        let preload = &env.iter().find(|(k, _)| k == "LD_PRELOAD").unwrap().1;
        assert_eq!(preload, "/lib/libheapscope_preload.so:/lib/other.so");
        assert!(env.iter().any(|(k, v)| k == ENV_OUT && v == "/work/r.json"));
        assert!(!env.iter().any(|(k, _)| k == ENV_PROFILE_CHILDREN));
    }

    #[test]
    fn test_profiling_env_profile_children_flag() {
        let env = profiling_env(
            Path::new("/lib/libheapscope_preload.so"),
            Path::new("/work/r.json"),
            true,
            None,
        );
        let preload = &env.iter().find(|(k, _)| k == "LD_PRELOAD").unwrap().1;
        assert_eq!(preload, "/lib/libheapscope_preload.so");
        assert!(env.iter().any(|(k, v)| k == ENV_PROFILE_CHILDREN && v == "1"));
    }
}
