//! Structured subprocess invocation.
//!
//! Every external tool (systemctl, dpkg, kubectl, lego, the k3s installer
//! script) is invoked through a [`CommandSpec`]: an explicit program, argument
//! list, and environment map. Secrets travel through the environment map and
//! are never spliced into a shell string.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::{InstallerError, InstallerResult};

/// A fully-described external command.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// One-line rendering for logs. Environment values are elided since they
    /// may hold credentials.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last non-empty stdout line. Vendor CLIs print the generated key as the
    /// final line of their output.
    pub fn last_stdout_line(&self) -> Option<&str> {
        self.stdout.lines().rev().find(|line| !line.trim().is_empty())
    }
}

/// Capability interface for running external commands.
///
/// Production code uses [`HostCommandRunner`]; tests substitute a recording
/// implementation so installer logic can be exercised without touching the
/// host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, capturing stdout and stderr.
    async fn run(&self, spec: &CommandSpec) -> InstallerResult<CommandOutput>;

    /// Run the command and report only whether it exited successfully.
    async fn run_ok(&self, spec: &CommandSpec) -> InstallerResult<bool> {
        Ok(self.run(spec).await?.success())
    }

    /// Run the command and fail with [`InstallerError::Command`] on a
    /// non-zero exit.
    async fn run_checked(&self, spec: &CommandSpec) -> InstallerResult<CommandOutput> {
        let output = self.run(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(InstallerError::Command {
                program: spec.program.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

pub type SharedRunner = Arc<dyn CommandRunner>;

/// Runs commands on the local host via `tokio::process`.
#[derive(Debug, Default)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> InstallerResult<CommandOutput> {
        tracing::debug!(command = %spec.display(), "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| InstallerError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            tracing::debug!(
                command = %spec.display(),
                code = ?result.code,
                "command exited with non-zero status"
            );
        }

        Ok(result)
    }
}

/// Run an executable script file with `sh`, forwarding an environment map.
pub async fn run_shell_script(
    runner: &dyn CommandRunner,
    script: &Path,
    env: BTreeMap<String, String>,
) -> InstallerResult<CommandOutput> {
    let mut spec = CommandSpec::new("sh").arg(script.display().to_string());
    spec.env = env;
    runner.run_checked(&spec).await
}
