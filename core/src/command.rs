//! External command execution

use crate::{Error, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

/// Helper to convert Path to &str with proper error handling
pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::validation(format!("Invalid path encoding: {}", path.display())))
}

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Turn a non-zero exit into an error carrying stderr
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let stderr = self.stderr.trim();
        let message = if stderr.is_empty() {
            format!("{} exited with status {}", what, self.exit_code)
        } else {
            format!("{}: {}", what, stderr)
        };
        Err(Error::Command {
            cmd: what.to_string(),
            message,
        })
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Run a command and capture output
pub fn run_cmd<S: AsRef<OsStr>>(cmd: &str, args: &[S]) -> Result<CommandOutput> {
    let output = Command::new(cmd).args(args).output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::CommandNotFound(cmd.to_string())
        } else {
            Error::Command {
                cmd: format!(
                    "{} {}",
                    cmd,
                    args.iter()
                        .map(|a| a.as_ref().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" ")
                ),
                message: e.to_string(),
            }
        }
    })?;

    Ok(output.into())
}

/// Check whether a command is on PATH
pub fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
