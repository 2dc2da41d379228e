use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use tokio::process::Command;

use crate::error::PipelineError;
use crate::process::{CommandOutcome, execute, shell_quote};

/// A container as reported by the engine's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    /// Engine state, e.g. `running`, `exited`, `created`.
    pub state: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Everything needed to start the deployment's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    pub image: String,
    /// Free-form engine flags, already shell-quoted by whoever wrote them.
    pub flags: String,
}

/// Container engine operations used by the pipeline.
///
/// Every method except [`ContainerEngine::launch`] takes structured
/// arguments. `launch` is the raw escape hatch: the flag string is spliced
/// into a shell command line verbatim, so whoever controls the manifest's
/// `runFlags` can run arbitrary commands as the deploying user.
pub trait ContainerEngine: Send + Sync {
    fn build_image<'a>(
        &'a self,
        context: &'a Path,
        dockerfile: &'a Path,
        tag: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;

    /// Ids of networks whose name is exactly `name`.
    fn find_networks<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, PipelineError>> + Send + 'a>>;

    fn create_network<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;

    /// All containers, stopped ones included, whose name is exactly `name`.
    fn find_containers<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ContainerSummary>, PipelineError>> + Send + 'a>>;

    /// Graceful stop with the engine's default timeout.
    fn stop_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;

    /// Remove a container together with its anonymous volumes.
    fn remove_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;

    /// Start a detached container. Returns the new container's id.
    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, PipelineError>> + Send + 'a>>;

    fn prune_build_cache<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}

/// [`ContainerEngine`] backed by the `docker` CLI (or anything
/// argument-compatible, such as `podman`). Selected with
/// `[engine] driver = "cli"`.
pub struct DockerCli {
    bin: String,
    timeout: Option<Duration>,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            bin: "docker".into(),
            timeout: None,
        }
    }

    pub fn with_bin(mut self, path: impl Into<String>) -> Self {
        self.bin = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.bin)
    }

    /// Run `cmd` and turn a non-zero exit into an engine error.
    async fn checked(&self, cmd: Command, action: &str) -> Result<CommandOutcome, PipelineError> {
        let outcome = execute(cmd, &self.bin, self.timeout).await?;
        if !outcome.success() {
            return Err(PipelineError::Engine(format!(
                "{} {action} failed ({}): {}",
                self.bin,
                outcome.status_text(),
                outcome.stderr_tail()
            )));
        }
        Ok(outcome)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerEngine for DockerCli {
    fn build_image<'a>(
        &'a self,
        context: &'a Path,
        dockerfile: &'a Path,
        tag: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.arg("build")
                .arg("--tag")
                .arg(tag)
                .arg("--file")
                .arg(dockerfile)
                .arg(context);
            let outcome = self.checked(cmd, "build").await?;
            tracing::debug!(output = %outcome.stdout, "Image build output");
            Ok(())
        })
    }

    fn find_networks<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.args(["network", "ls", "--no-trunc", "--format", "{{.ID}}\t{{.Name}}"])
                .arg("--filter")
                .arg(format!("name={name}"));
            let outcome = self.checked(cmd, "network ls").await?;
            Ok(parse_network_rows(&outcome.stdout, name))
        })
    }

    fn create_network<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.args(["network", "create"]).arg(name);
            self.checked(cmd, "network create").await?;
            Ok(())
        })
    }

    fn find_containers<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ContainerSummary>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.args([
                "ps",
                "--all",
                "--no-trunc",
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.State}}",
            ])
            .arg("--filter")
            .arg(format!("name={name}"));
            let outcome = self.checked(cmd, "ps").await?;
            Ok(parse_container_rows(&outcome.stdout, name))
        })
    }

    fn stop_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.arg("stop").arg(id);
            self.checked(cmd, "stop").await?;
            Ok(())
        })
    }

    fn remove_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.args(["rm", "--volumes"]).arg(id);
            self.checked(cmd, "rm").await?;
            Ok(())
        })
    }

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let line = launch_command_line(&self.bin, request);
            tracing::debug!(command = %line, "Launching container");
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&line);
            let outcome = self.checked(cmd, "run").await?;
            Ok(outcome.stdout.trim().to_string())
        })
    }

    fn prune_build_cache<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = self.command();
            cmd.args(["builder", "prune", "--all", "--force"]);
            self.checked(cmd, "builder prune").await?;
            Ok(())
        })
    }
}

/// `<bin> run -d <flags> --name <name> <image>` as one shell line.
///
/// `flags` goes in untouched; the other parts are quoted if needed.
pub fn launch_command_line(bin: &str, request: &LaunchRequest) -> String {
    let mut parts = vec![shell_quote(bin), "run".to_string(), "-d".to_string()];
    let flags = request.flags.trim();
    if !flags.is_empty() {
        parts.push(flags.to_string());
    }
    parts.push("--name".into());
    parts.push(shell_quote(&request.name));
    parts.push(shell_quote(&request.image));
    parts.join(" ")
}

// `--filter name=` is a substring match, so rows are re-checked here.
fn parse_network_rows(stdout: &str, name: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .filter(|(_, network)| network.trim() == name)
        .map(|(id, _)| id.trim().to_string())
        .collect()
}

fn parse_container_rows(stdout: &str, name: &str) -> Vec<ContainerSummary> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            let names = fields.next()?.trim();
            let state = fields.next().unwrap_or_default().trim();
            let matched = names
                .split(',')
                .map(|n| n.trim_start_matches('/'))
                .any(|n| n == name);
            matched.then(|| ContainerSummary {
                id: id.to_string(),
                name: name.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}
