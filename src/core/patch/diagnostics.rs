use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

use crate::core::error::{LauncherError, LauncherResult};
use crate::core::process::CapturedOutput;

use super::steps::PatchStep;

/// Dump every attempt of a failed step into `logs_dir` for support triage.
pub fn write_failure_log(
    logs_dir: &Path,
    branch: &str,
    step: &PatchStep,
    attempts: &[(&str, &CapturedOutput)],
) -> LauncherResult<PathBuf> {
    std::fs::create_dir_all(logs_dir).map_err(|source| LauncherError::io(logs_dir, source))?;
    let now = Utc::now();
    let path = logs_dir.join(format!(
        "patch-failure-{}-{}.log",
        step.file_stem(),
        now.format("%Y%m%d-%H%M%S%.3f")
    ));

    let mut report = String::new();
    let _ = writeln!(report, "timestamp: {}", now.to_rfc3339());
    let _ = writeln!(report, "branch: {branch}");
    let _ = writeln!(report, "step: {} -> {}", step.from, step.to);
    let _ = writeln!(report, "patch url: {}", step.pwr);
    let _ = writeln!(report, "signature url: {}", step.sig);
    for (label, output) in attempts {
        let _ = writeln!(report, "\n=== {label} ===");
        let _ = writeln!(report, "command: {}", output.command_line);
        let _ = writeln!(report, "exit code: {:?}", output.exit_code);
        let _ = writeln!(report, "--- stdout ---\n{}", output.stdout.trim_end());
        let _ = writeln!(report, "--- stderr ---\n{}", output.stderr.trim_end());
    }

    std::fs::write(&path, report).map_err(|source| LauncherError::io(&path, source))?;
    info!("Patch diagnostics written to {:?}", path);
    Ok(path)
}

/// One-line reason for an error message: last stderr line, else exit code.
pub fn summarize(output: &CapturedOutput) -> String {
    let last_line = |text: &str| {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
    };
    last_line(&output.stderr)
        .or_else(|| last_line(&output.stdout))
        .unwrap_or_else(|| format!("exit code {:?}", output.exit_code))
}
