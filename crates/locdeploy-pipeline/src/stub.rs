//! In-memory stand-ins for the external collaborators, for tests and dry
//! runs. They record every call and keep just enough state to behave like
//! the real thing across a whole pipeline run.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use crate::engine::{ContainerEngine, ContainerSummary, LaunchRequest};
use crate::error::PipelineError;
use crate::process::{CommandOutcome, CommandRunner};
use crate::source::SourceFetcher;

/// Fetcher that writes canned files instead of cloning.
#[derive(Debug, Default)]
pub struct StubFetcher {
    files: HashMap<String, Vec<(String, String)>>,
    failing: HashSet<String>,
    fetched: Mutex<Vec<(String, String)>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file (path relative to the checkout root) to `repo`.
    pub fn with_file(mut self, repo: &str, path: &str, contents: &str) -> Self {
        self.files
            .entry(repo.to_string())
            .or_default()
            .push((path.to_string(), contents.to_string()));
        self
    }

    /// Make every fetch of `repo` fail.
    pub fn failing(mut self, repo: &str) -> Self {
        self.failing.insert(repo.to_string());
        self
    }

    /// `(repo, tag)` pairs in fetch order.
    pub fn fetched(&self) -> Vec<(String, String)> {
        self.fetched.lock().unwrap().clone()
    }
}

impl SourceFetcher for StubFetcher {
    fn fetch<'a>(
        &'a self,
        repo: &'a str,
        tag: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.fetched
                .lock()
                .unwrap()
                .push((repo.to_string(), tag.to_string()));

            if self.failing.contains(repo) {
                return Err(PipelineError::SourceFetch {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                    reason: "stub failure".into(),
                });
            }

            for (path, contents) in self.files.get(repo).into_iter().flatten() {
                let target = dest.join(path);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, contents).await?;
            }
            Ok(())
        })
    }
}

/// Shell runner that records commands and returns a fixed exit code.
#[derive(Debug)]
pub struct StubRunner {
    exit_code: i32,
    calls: Mutex<Vec<(String, PathBuf)>>,
}

impl StubRunner {
    pub fn succeeding() -> Self {
        Self::with_exit_code(0)
    }

    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(command, working directory)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for StubRunner {
    fn run_shell<'a>(
        &'a self,
        command: &'a str,
        cwd: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<CommandOutcome, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_string(), cwd.to_path_buf()));
            Ok(CommandOutcome {
                code: Some(self.exit_code),
                stdout: String::new(),
                stderr: if self.exit_code == 0 {
                    String::new()
                } else {
                    "stub build failed".into()
                },
            })
        })
    }
}

/// One recorded [`ContainerEngine`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    BuildImage {
        context: PathBuf,
        dockerfile: PathBuf,
        tag: String,
    },
    FindNetworks(String),
    CreateNetwork(String),
    FindContainers(String),
    StopContainer(String),
    RemoveContainer(String),
    Launch(LaunchRequest),
    PruneBuildCache,
}

/// Engine operations that [`RecordingEngine`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    BuildImage,
    FindNetworks,
    CreateNetwork,
    FindContainers,
    StopContainer,
    RemoveContainer,
    Launch,
    PruneBuildCache,
}

/// Engine that tracks networks and containers in memory.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
    networks: Mutex<Vec<String>>,
    containers: Mutex<Vec<ContainerSummary>>,
    failing: HashSet<EngineOp>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(self, name: &str) -> Self {
        self.networks.lock().unwrap().push(name.to_string());
        self
    }

    pub fn with_container(self, id: &str, name: &str, state: &str) -> Self {
        self.containers.lock().unwrap().push(ContainerSummary {
            id: id.to_string(),
            name: name.to_string(),
            state: state.to_string(),
        });
        self
    }

    pub fn failing(mut self, op: EngineOp) -> Self {
        self.failing.insert(op);
        self
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.lock().unwrap().clone()
    }

    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.containers.lock().unwrap().clone()
    }

    fn record(&self, call: EngineCall, op: EngineOp) -> Result<(), PipelineError> {
        self.calls.lock().unwrap().push(call);
        if self.failing.contains(&op) {
            return Err(PipelineError::Engine(format!("stub {op:?} failure")));
        }
        Ok(())
    }
}

impl ContainerEngine for RecordingEngine {
    fn build_image<'a>(
        &'a self,
        context: &'a Path,
        dockerfile: &'a Path,
        tag: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(
                EngineCall::BuildImage {
                    context: context.to_path_buf(),
                    dockerfile: dockerfile.to_path_buf(),
                    tag: tag.to_string(),
                },
                EngineOp::BuildImage,
            )
        })
    }

    fn find_networks<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(EngineCall::FindNetworks(name.to_string()), EngineOp::FindNetworks)?;
            Ok(self
                .networks
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.as_str() == name)
                .cloned()
                .collect())
        })
    }

    fn create_network<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(EngineCall::CreateNetwork(name.to_string()), EngineOp::CreateNetwork)?;
            self.networks.lock().unwrap().push(name.to_string());
            Ok(())
        })
    }

    fn find_containers<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ContainerSummary>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            self.record(
                EngineCall::FindContainers(name.to_string()),
                EngineOp::FindContainers,
            )?;
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.name == name)
                .cloned()
                .collect())
        })
    }

    fn stop_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(EngineCall::StopContainer(id.to_string()), EngineOp::StopContainer)?;
            for container in self.containers.lock().unwrap().iter_mut() {
                if container.id == id {
                    container.state = "exited".into();
                }
            }
            Ok(())
        })
    }

    fn remove_container<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(
                EngineCall::RemoveContainer(id.to_string()),
                EngineOp::RemoveContainer,
            )?;
            self.containers.lock().unwrap().retain(|c| c.id != id);
            Ok(())
        })
    }

    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.record(EngineCall::Launch(request.clone()), EngineOp::Launch)?;
            let id = format!("{}-new", request.name);
            self.containers.lock().unwrap().push(ContainerSummary {
                id: id.clone(),
                name: request.name.clone(),
                state: "running".into(),
            });
            Ok(id)
        })
    }

    fn prune_build_cache<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move { self.record(EngineCall::PruneBuildCache, EngineOp::PruneBuildCache) })
    }
}
