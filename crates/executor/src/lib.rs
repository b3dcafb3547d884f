//! Command Executor
//!
//! Runs one shell command to completion and reduces the outcome to what the
//! caller asked for: the full combined output (`detail`) or a one-word verdict.
//! Failures never escape as errors; they become the `error` verdict.

use std::process::{Command, Stdio};

use tracing::{debug, warn};

pub const DETAIL_MODE: &str = "detail";
pub const DONE: &str = "done";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Reply with the captured stdout+stderr.
    Detail,
    /// Reply with `done` or `error` only.
    Brief,
}

impl OutputMode {
    /// `detail` selects [`OutputMode::Detail`]; any other word is brief.
    pub fn parse(mode: &str) -> Self {
        if mode.trim() == DETAIL_MODE {
            OutputMode::Detail
        } else {
            OutputMode::Brief
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: Vec<u8>,
}

impl CommandOutcome {
    fn error() -> Self {
        Self {
            success: false,
            output: ERROR.as_bytes().to_vec(),
        }
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Returns a platform shell invocation for `script` with stderr folded into
/// stdout, so the captured bytes keep the order the command wrote them in.
/// - Unix: `bash -c 'exec 2>&1; <script>'`
/// - Windows: `cmd /C <script> 2>&1`
pub fn shell_command(script: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(format!("exec 2>&1\n{script}"));
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(format!("{script} 2>&1"));
        cmd
    }
}

/// Run `command` through the shell and shape the result by `mode`.
///
/// An empty mode or command yields `error` without spawning anything. In
/// detail mode a failing command still returns whatever it printed, falling
/// back to `error` when it printed nothing.
pub fn run(mode: &str, command: &str) -> CommandOutcome {
    if mode.trim().is_empty() || command.trim().is_empty() {
        return CommandOutcome::error();
    }
    let mode = OutputMode::parse(mode);

    let output = match shell_command(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => output,
        Err(err) => {
            warn!("failed to spawn shell: {}", err);
            return CommandOutcome::error();
        }
    };

    let mut captured = output.stdout;
    captured.extend_from_slice(&output.stderr);

    if output.status.success() {
        debug!(bytes = captured.len(), "command finished");
        return match mode {
            OutputMode::Detail => CommandOutcome {
                success: true,
                output: captured,
            },
            OutputMode::Brief => CommandOutcome {
                success: true,
                output: DONE.as_bytes().to_vec(),
            },
        };
    }

    warn!(status = ?output.status.code(), "command failed");
    match mode {
        OutputMode::Detail if !captured.is_empty() => CommandOutcome {
            success: false,
            output: captured,
        },
        _ => CommandOutcome::error(),
    }
}
