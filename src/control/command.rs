//! Running external network tools (`tc`, `nft`).

use std::process::Stdio;
use tracing::debug;

use crate::{Error, Result};

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes a program with arguments.
///
/// Implementations return [`Error::Command`] for a non-zero exit status,
/// carrying the captured stdout and stderr.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands on the host through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(?cmd, "running command");

        let output = cmd.output().await.map_err(|e| Error::Command {
            command: command_line(program, args),
            status: "spawn failed".to_string(),
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            debug!(?stderr, status = ?output.status, ?cmd, "command returned non-zero status");
            return Err(Error::Command {
                command: command_line(program, args),
                status: output.status.to_string(),
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Program and arguments joined for messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Build an argument list from string slices.
pub(crate) fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_arguments() {
        assert_eq!(
            command_line("tc", &args(["qdisc", "delete", "dev", "eth0", "root"])),
            "tc qdisc delete dev eth0 root"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_captures_output() {
        let output = SystemRunner.run("echo", &args(["hello"])).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_reports_non_zero_status() {
        let error = SystemRunner.run("false", &[]).await.unwrap_err();
        let Error::Command { command, .. } = &error else {
            panic!("expected a command error, got {error:?}");
        };
        assert_eq!(command, "false");
        assert!(error.is_fatal());
    }
}
