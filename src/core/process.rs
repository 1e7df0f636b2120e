// ─── Child Processes ───
// Spawning and output capture for the external tools (diff applier,
// runtime self-check). Every call is bounded by a timeout and a
// cancellation token; the child is killed when either fires.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{LauncherError, LauncherResult};

/// Exit status and captured streams of a finished child.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Both streams, for heuristics that do not care which one the tool used.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Command with piped output, no console window, killed on drop.
pub fn tool_command<I, S>(program: &Path, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    configure_platform_spawn(&mut cmd);
    cmd
}

/// Run to completion and capture stdout/stderr.
///
/// A non-zero exit is *not* an error here; callers inspect `success`.
pub async fn run_captured(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> LauncherResult<CapturedOutput> {
    let command_line = format_command_for_logs(&cmd);
    debug!("Running: {}", command_line);
    let program = cmd.as_std().get_program().to_os_string();

    let child = cmd
        .spawn()
        .map_err(|source| LauncherError::io(Path::new(&program), source))?;

    let output = tokio::select! {
        _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
        waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
            Ok(result) => result.map_err(|source| LauncherError::io(Path::new(&program), source))?,
            Err(_) => {
                return Err(LauncherError::ToolUnavailable {
                    tool: program.to_string_lossy().to_string(),
                    detail: format!("timed out after {}s", timeout.as_secs()),
                })
            }
        },
    };

    Ok(CapturedOutput {
        command_line,
        exit_code: output.status.code(),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn configure_platform_spawn(cmd: &mut Command) {
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    let _ = cmd;
}

pub fn format_command_for_logs(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let program = shell_escape(&std_cmd.get_program().to_string_lossy());
    let args = std_cmd
        .get_args()
        .map(|arg| shell_escape(&arg.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ");

    if args.is_empty() {
        program
    } else {
        format!("{} {}", program, args)
    }
}

fn shell_escape(raw: &str) -> String {
    if raw.is_empty() {
        return "\"\"".to_string();
    }

    if raw.chars().all(|ch| {
        ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':' | '\\' | '=')
    }) {
        return raw.to_string();
    }

    format!("\"{}\"", raw.replace('"', "\\\""))
}
