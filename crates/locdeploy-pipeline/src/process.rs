use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use crate::error::PipelineError;

/// Captured result of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable exit status for logs and errors.
    pub fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "signal".into(),
        }
    }

    /// Last few lines of stderr, enough to explain a failure in one log line.
    pub fn stderr_tail(&self) -> String {
        tail(&self.stderr, 20)
    }

    fn from_output(output: Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs user-supplied shell commands, such as an artifact's build command.
pub trait CommandRunner: Send + Sync {
    fn run_shell<'a>(
        &'a self,
        command: &'a str,
        cwd: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutcome, PipelineError>> + Send + 'a>>;
}

/// Runs commands through `<shell> -c`.
pub struct ShellRunner {
    shell: String,
    timeout: Option<Duration>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "bash".into(),
            timeout: None,
        }
    }

    /// Override the shell binary (default `bash`).
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ShellRunner {
    fn run_shell<'a>(
        &'a self,
        command: &'a str,
        cwd: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutcome, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.shell);
            cmd.arg("-c").arg(command).current_dir(cwd);
            tracing::debug!(shell = %self.shell, command, cwd = %cwd.display(), "Running shell command");
            execute(cmd, &self.shell, self.timeout).await
        })
    }
}

/// Spawn `cmd`, capture its output and enforce `timeout` if one is set.
///
/// The child is killed when the timeout elapses. A spawn failure is
/// returned as `Io`; a non-zero exit is not an error at this level.
pub async fn execute(
    mut cmd: Command,
    program: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutcome, PipelineError> {
    cmd.kill_on_drop(true);
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| PipelineError::CommandTimeout {
                program: program.to_string(),
                secs: limit.as_secs(),
            })??,
        None => cmd.output().await?,
    };
    Ok(CommandOutcome::from_output(output))
}

/// Quote `value` for `sh -c` unless it is made only of characters the shell
/// leaves alone.
pub fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@%+=,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
