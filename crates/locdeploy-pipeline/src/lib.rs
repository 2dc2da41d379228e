//! Single-host deployment pipeline.
//!
//! Given a YAML manifest, [`Orchestrator`] fetches an artifact repository
//! and a config repository, overlays the config into the artifact tree,
//! runs the artifact's build command, builds a container image and replaces
//! the running container with one started from that image.
//!
//! [`DockerApi`] talks to the Docker Engine API; [`DockerCli`] drives a
//! `docker`-compatible binary such as `podman`.
//!
//! External tools sit behind traits ([`SourceFetcher`], [`CommandRunner`],
//! [`ContainerEngine`]); the [`stub`] module has in-memory versions of each.
//!
//! ```rust,no_run
//! use locdeploy_pipeline::{DockerApi, GitFetcher, Orchestrator, RandomIdGenerator, ShellRunner};
//!
//! # async fn run() -> Result<(), locdeploy_pipeline::PipelineError> {
//! let fetcher = GitFetcher::new();
//! let engine = DockerApi::connect()?;
//! let runner = ShellRunner::new();
//! let ids = RandomIdGenerator::new();
//!
//! let manifest = std::fs::read_to_string("deploy.yml")?;
//! let report = Orchestrator::new(&fetcher, &engine, &runner, &ids)
//!     .run(&manifest)
//!     .await?;
//! println!("{} is running {}", report.container_name, report.image);
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod config;
pub mod deploy;
pub mod docker_api;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod naming;
pub mod orchestrator;
pub mod process;
pub mod source;
pub mod stub;
pub mod workspace;

pub use config::{EngineDriver, RunnerConfig};
pub use docker_api::DockerApi;
pub use engine::{ContainerEngine, DockerCli};
pub use error::PipelineError;
pub use manifest::{DeploymentManifest, ImageRef, ManifestResolver};
pub use naming::{IdGenerator, RandomIdGenerator};
pub use orchestrator::{DeploymentReport, Orchestrator};
pub use process::{CommandRunner, ShellRunner};
pub use source::{GitFetcher, MergeStrategy, ShallowOverlay, SourceFetcher};
pub use workspace::Workspace;
