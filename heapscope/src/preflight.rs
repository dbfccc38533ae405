//! Pre-flight checks for heapscope
//!
//! Validates the run before spawning anything, so failures surface as clear,
//! actionable messages instead of a dynamic-loader error inside the target.

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::{Path, PathBuf};

/// Run all pre-flight checks before launching the target.
pub fn run_preflight_checks(program: &str, runtime: &Path, quiet: bool) -> Result<()> {
    let resolved = check_target_exists(program)?;
    check_runtime_library(runtime)?;
    check_debug_symbols(&resolved, quiet);
    Ok(())
}

/// Resolve the target program the way the shell would and make sure it is an
/// executable file.
fn check_target_exists(program: &str) -> Result<PathBuf> {
    let resolved = resolve_program(program)
        .with_context(|| format!("Target not found: {program}"))?;
    if !resolved.is_file() {
        bail!(
            "Not a file: {}\n\n\
             The COMMAND must name an executable file, not a directory.",
            resolved.display()
        );
    }
    Ok(resolved)
}

fn resolve_program(program: &str) -> Result<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return std::fs::canonicalize(path)
            .with_context(|| format!("No such path: {program}"));
    }
    // Bare name: search PATH like execvp will.
    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .with_context(|| format!("'{program}' not found in PATH"))
}

fn check_runtime_library(runtime: &Path) -> Result<()> {
    if !runtime.is_file() {
        bail!(
            "Runtime library not found: {}\n\n\
             Pass --runtime with the path to libheapscope_preload.so",
            runtime.display()
        );
    }
    Ok(())
}

/// Advisory only: the profiler works without debug info, but stack traces in
/// the report degrade to raw addresses and exported symbols.
fn check_debug_symbols(target: &Path, quiet: bool) {
    if quiet {
        return;
    }

    let Ok(data) = std::fs::read(target) else { return };
    let Ok(obj) = object::File::parse(&*data) else {
        // Not an ELF we can parse (a script, say); the loader will sort it out.
        return;
    };

    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);
    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);

    if !has_debug_info {
        log::warn!(
            "{} has no DWARF debug info; report stacks will lack source locations \
             (compile with -g or debug = true)",
            target.display()
        );
    } else if !has_symtab {
        log::warn!("{} appears stripped; symbol names may be incomplete", target.display());
    }
}
