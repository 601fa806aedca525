//! Backend command runner
//!
//! Every repository operation is a subprocess of the version-control binary
//! rooted at the repository's working directory. No timeout is applied.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use crate::error::{CmeError, Result};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Invokes the backend binary.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    bin_path: PathBuf,
}

impl CommandRunner {
    pub fn new(bin_path: impl Into<PathBuf>) -> Self {
        Self {
            bin_path: bin_path.into(),
        }
    }

    pub fn bin_path(&self) -> &Path {
        &self.bin_path
    }

    fn command(&self, dir: &Path, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.args(args)
            .current_dir(dir)
            // Never block on a credential prompt, keep messages parseable.
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        let bin = self
            .bin_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{} {}", bin, args.join(" "))
    }

    /// Run to completion and return stdout. A non-zero exit is an error
    /// carrying stderr.
    pub async fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = self.run_captured(dir, args).await?;
        if !out.success() {
            return Err(CmeError::Command {
                command: self.describe(args),
                status: out.status.to_string(),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    /// Run to completion and return stdout and stderr regardless of the exit
    /// status, for callers that need the diagnostics.
    pub async fn run_captured(&self, dir: &Path, args: &[&str]) -> Result<CommandOutput> {
        tracing::trace!("exec in {:?}: {}", dir, self.describe(args));
        let output = self
            .command(dir, args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status,
        })
    }

    /// Start the command with piped stdin/stdout/stderr and hand the child
    /// to the caller for streaming.
    pub fn spawn(&self, dir: &Path, args: &[&str]) -> Result<Child> {
        tracing::trace!("spawn in {:?}: {}", dir, self.describe(args));
        let child = self
            .command(dir, args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }
}
