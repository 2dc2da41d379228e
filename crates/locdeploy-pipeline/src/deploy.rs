use crate::engine::{ContainerEngine, LaunchRequest};
use crate::error::PipelineError;
use crate::manifest::{DeploymentManifest, ImageRef};
use crate::process::shell_quote;

/// What [`DeploymentReplacer::replace`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub container_id: String,
    /// Ids of the containers that were removed to make room.
    pub replaced: Vec<String>,
    pub network_created: bool,
    /// Flags the container was launched with.
    pub run_flags: String,
}

/// Swaps whatever container holds `deploy.name` for a fresh one.
pub struct DeploymentReplacer<'a> {
    engine: &'a dyn ContainerEngine,
}

impl<'a> DeploymentReplacer<'a> {
    pub fn new(engine: &'a dyn ContainerEngine) -> Self {
        Self { engine }
    }

    pub async fn replace(
        &self,
        manifest: &DeploymentManifest,
        image: &ImageRef,
    ) -> Result<ReplaceOutcome, PipelineError> {
        let deploy = &manifest.deploy;
        let network = deploy.network.as_deref();

        let network_created = match network {
            Some(name) => self.ensure_network(name).await?,
            None => false,
        };

        let replaced = self.remove_existing(&deploy.name).await?;

        let run_flags = compose_run_flags(deploy.run_flags.as_deref(), network);
        let request = LaunchRequest {
            name: deploy.name.clone(),
            image: image.to_string(),
            flags: run_flags.clone(),
        };
        tracing::info!(container = %deploy.name, image = %request.image, "Starting new container");
        let container_id =
            self.engine
                .launch(&request)
                .await
                .map_err(|e| PipelineError::ContainerLaunch {
                    name: deploy.name.clone(),
                    reason: e.to_string(),
                })?;

        Ok(ReplaceOutcome {
            container_id,
            replaced,
            network_created,
            run_flags,
        })
    }

    /// Create `name` unless a network with exactly that name exists.
    /// Returns whether one was created.
    async fn ensure_network(&self, name: &str) -> Result<bool, PipelineError> {
        let network_error = |e: PipelineError| PipelineError::Network {
            network: name.to_string(),
            reason: e.to_string(),
        };

        let existing = self.engine.find_networks(name).await.map_err(network_error)?;
        if !existing.is_empty() {
            tracing::debug!(network = %name, "Network already present");
            return Ok(false);
        }

        tracing::info!(network = %name, "Network not found, creating");
        self.engine
            .create_network(name)
            .await
            .map_err(network_error)?;
        Ok(true)
    }

    /// Stop (if running) and remove every container named `name`.
    async fn remove_existing(&self, name: &str) -> Result<Vec<String>, PipelineError> {
        let replace_error = |e: PipelineError| PipelineError::ContainerReplace {
            name: name.to_string(),
            reason: e.to_string(),
        };

        let existing = self
            .engine
            .find_containers(name)
            .await
            .map_err(replace_error)?;

        let mut removed = Vec::with_capacity(existing.len());
        for container in existing {
            tracing::info!(container = %name, id = %container.id, state = %container.state, "Existing container found");
            if container.is_running() {
                tracing::info!(container = %name, "Stopping container");
                self.engine
                    .stop_container(&container.id)
                    .await
                    .map_err(replace_error)?;
            }
            tracing::info!(container = %name, "Removing existing container");
            self.engine
                .remove_container(&container.id)
                .await
                .map_err(replace_error)?;
            removed.push(container.id);
        }
        Ok(removed)
    }
}

/// Start from `run_flags` as written and append `--network <network>` when
/// a network is configured and the flags do not already pick one.
pub fn compose_run_flags(run_flags: Option<&str>, network: Option<&str>) -> String {
    let mut flags = run_flags.unwrap_or_default().trim().to_string();
    if let Some(network) = network
        && !has_network_flag(&flags)
    {
        if !flags.is_empty() {
            flags.push(' ');
        }
        flags.push_str("--network ");
        flags.push_str(&shell_quote(network));
    }
    flags
}

fn has_network_flag(flags: &str) -> bool {
    flags
        .split_whitespace()
        .any(|token| token == "--network" || token.starts_with("--network="))
}
