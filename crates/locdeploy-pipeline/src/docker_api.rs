use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{ListContainersOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::image::BuildImageOptions;
use bollard::models::ContainerSummary as ApiContainer;
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use futures::StreamExt;

use crate::engine::{ContainerEngine, ContainerSummary, DockerCli, LaunchRequest};
use crate::error::PipelineError;

/// [`ContainerEngine`] backed by the Docker Engine API.
///
/// Image builds, listings, network and container lifecycle calls go over
/// the API. `launch` and `prune_build_cache` are delegated to the CLI:
/// launch has to splice `runFlags` into a command line, and build cache
/// pruning is a builder command.
pub struct DockerApi {
    docker: Docker,
    cli: DockerCli,
}

impl DockerApi {
    /// Connect through `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, PipelineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            cli: DockerCli::new(),
        })
    }

    /// CLI binary used for `launch` and build cache pruning.
    pub fn with_bin(mut self, path: impl Into<String>) -> Self {
        self.cli = self.cli.with_bin(path);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(limit) = timeout {
            self.docker = self.docker.with_timeout(limit);
        }
        self.cli = self.cli.with_timeout(timeout);
        self
    }
}

impl ContainerEngine for DockerApi {
    fn build_image<'a>(
        &'a self,
        context: &'a Path,
        dockerfile: &'a Path,
        tag: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let archive = context_archive(context.to_path_buf()).await?;
            let options = BuildImageOptions {
                dockerfile: dockerfile_in_context(context, dockerfile),
                t: tag.to_string(),
                rm: true,
                ..Default::default()
            };
            tracing::debug!(tag, bytes = archive.len(), "Sending build context");

            let mut progress =
                Box::pin(self.docker.build_image(options, None, Some(archive.into())));
            while let Some(item) = progress.next().await {
                let info = item?;
                if let Some(error) = info.error {
                    return Err(PipelineError::Engine(error));
                }
                if let Some(line) = info.stream.as_deref().map(str::trim_end)
                    && !line.is_empty()
                {
                    tracing::debug!(output = %line, "Image build output");
                }
            }
            Ok(())
        })
    }

    fn find_networks<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let options = ListNetworksOptions {
                filters: name_filter(name),
            };
            let networks = self.docker.list_networks(Some(options)).await?;
            // The name filter matches substrings.
            Ok(networks
                .into_iter()
                .filter(|n| n.name.as_deref() == Some(name))
                .filter_map(|n| n.id)
                .collect())
        })
    }

    fn create_network<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let options = CreateNetworkOptions {
                name: name.to_string(),
                ..Default::default()
            };
            let created = self.docker.create_network(options).await?;
            tracing::debug!(network = %name, id = ?created.id, "Network created");
            Ok(())
        })
    }

    fn find_containers<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ContainerSummary>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let options = ListContainersOptions {
                all: true,
                filters: name_filter(name),
                ..Default::default()
            };
            let containers = self.docker.list_containers(Some(options)).await?;
            Ok(containers
                .into_iter()
                .filter_map(|c| summarize(c, name))
                .collect())
        })
    }

    fn stop_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.docker
                .stop_container(id, None::<StopContainerOptions>)
                .await?;
            Ok(())
        })
    }

    fn remove_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let options = RemoveContainerOptions {
                v: true,
                ..Default::default()
            };
            self.docker.remove_container(id, Some(options)).await?;
            Ok(())
        })
    }

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, PipelineError>> + Send + 'a>> {
        self.cli.launch(request)
    }

    fn prune_build_cache<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        self.cli.prune_build_cache()
    }
}

fn name_filter(name: &str) -> HashMap<String, Vec<String>> {
    HashMap::from([("name".to_string(), vec![name.to_string()])])
}

/// Keep `container` only if one of its names is exactly `name`.
///
/// The API reports names with a leading `/`.
fn summarize(container: ApiContainer, name: &str) -> Option<ContainerSummary> {
    let matched = container
        .names
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|n| n.trim_start_matches('/') == name);
    if !matched {
        return None;
    }
    Some(ContainerSummary {
        id: container.id?,
        name: name.to_string(),
        state: container.state.map(|s| s.to_string()).unwrap_or_default(),
    })
}

/// Dockerfile path as the daemon sees it inside the uploaded context.
fn dockerfile_in_context(context: &Path, dockerfile: &Path) -> String {
    dockerfile
        .strip_prefix(context)
        .unwrap_or(dockerfile)
        .to_string_lossy()
        .into_owned()
}

/// Tar up the build context. Symlinks are archived as links.
async fn context_archive(context: PathBuf) -> Result<Vec<u8>, PipelineError> {
    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &context)?;
        builder.into_inner()
    })
    .await
    .map_err(|e| PipelineError::Engine(format!("build context task failed: {e}")))?
    .map_err(PipelineError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn api_container(id: &str, names: &[&str]) -> ApiContainer {
        ApiContainer {
            id: Some(id.into()),
            names: Some(names.iter().map(|n| n.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn summaries_require_exact_name() {
        assert_eq!(
            summarize(api_container("c1", &["/app1"]), "app1").map(|c| c.id),
            Some("c1".to_string())
        );
        assert!(summarize(api_container("c2", &["/app10"]), "app1").is_none());
        assert!(summarize(api_container("c3", &["/other", "/app1-old"]), "app1").is_none());
        assert!(summarize(ApiContainer::default(), "app1").is_none());
    }

    #[test]
    fn container_without_state_is_not_running() {
        let summary = summarize(api_container("c1", &["/app1"]), "app1").unwrap();
        assert_eq!(summary.state, "");
        assert!(!summary.is_running());
    }

    #[test]
    fn dockerfile_is_relative_to_context() {
        let context = Path::new("/work/123/app");
        assert_eq!(
            dockerfile_in_context(context, &context.join("docker/Dockerfile.prod")),
            "docker/Dockerfile.prod"
        );
        assert_eq!(
            dockerfile_in_context(context, Path::new("Dockerfile")),
            "Dockerfile"
        );
    }

    #[tokio::test]
    async fn context_archive_contains_the_tree() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Dockerfile"), "FROM scratch").unwrap();
        std::fs::create_dir(tmp.path().join("conf")).unwrap();
        std::fs::write(tmp.path().join("conf/app.properties"), "port=8080").unwrap();

        let archive = context_archive(tmp.path().to_path_buf()).await.unwrap();

        let mut entries: Vec<String> = tar::Archive::new(archive.as_slice())
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .map(|p| p.trim_start_matches("./").trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty() && p != ".")
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["Dockerfile", "conf", "conf/app.properties"]);
    }

    #[tokio::test]
    async fn context_archive_of_missing_dir_is_an_error() {
        let err = context_archive(PathBuf::from("/nonexistent/locdeploy-context"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[tokio::test]
    #[ignore] // Requires a running docker daemon
    async fn lists_containers_against_real_daemon() {
        let engine = DockerApi::connect().unwrap();
        let found = engine
            .find_containers("locdeploy-test-does-not-exist")
            .await
            .unwrap();
        assert!(found.is_empty());
        assert!(engine.find_networks("locdeploy-test-does-not-exist").await.unwrap().is_empty());
    }
}
