//! External tool invocation
//!
//! Image and partition work is delegated to standard Linux tools
//! (fallocate, losetup, parted, mkfs.vfat, mount, fls, ...). Availability is
//! probed with `which` so callers can pick a degraded path instead of failing.

use std::ffi::OsStr;
use std::process::{Command, Output, Stdio};
use tracing::debug;

use crate::error::{AppError, Result};

/// Check whether a tool is on `PATH`
pub fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Check that every tool in `names` is on `PATH`
pub fn tools_available(names: &[&str]) -> bool {
    names.iter().all(|n| tool_available(n))
}

fn describe<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

/// Run a command and capture its output; non-zero exit is an error
pub fn run_output<I, S>(program: &str, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    let line = describe(program, args.clone());
    debug!("exec: {}", line);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| AppError::Storage(format!("Failed to run {}: {}", line, e)))?;

    if !output.status.success() {
        return Err(AppError::Storage(format!(
            "{} failed ({}): {}",
            line,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output)
}

/// Run a command and return its trimmed stdout
pub fn run_stdout<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    let output = run_output(program, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command, requiring success
pub fn run<I, S>(program: &str, args: I) -> Result<()>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    run_output(program, args).map(|_| ())
}

/// Run a command whose failure is tolerated; returns whether it succeeded
pub fn run_best_effort<I, S>(program: &str, args: I) -> bool
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    match run_output(program, args) {
        Ok(_) => true,
        Err(e) => {
            debug!("best-effort command failed: {}", e);
            false
        }
    }
}
