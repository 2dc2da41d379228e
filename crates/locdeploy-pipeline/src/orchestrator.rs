use std::path::PathBuf;
use std::time::Instant;

use crate::build::BuildExecutor;
use crate::deploy::DeploymentReplacer;
use crate::engine::ContainerEngine;
use crate::error::PipelineError;
use crate::manifest::{self, DeploymentManifest, ImageRef};
use crate::naming::IdGenerator;
use crate::process::CommandRunner;
use crate::source::{MergeStrategy, ShallowOverlay, SourceAssembler, SourceFetcher};
use crate::workspace::Workspace;

/// Wall-clock time spent in each stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub assemble_ms: u64,
    pub build_ms: u64,
    pub deploy_ms: u64,
    pub total_ms: u64,
}

/// Result of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentReport {
    pub deployment: String,
    pub image: ImageRef,
    pub container_name: String,
    pub container_id: String,
    /// Ids of the previous containers that were removed.
    pub replaced: Vec<String>,
    pub network_created: bool,
    pub run_flags: String,
    pub timings: StageTimings,
}

/// Runs the deployment pipeline for one manifest:
///
/// 1. Resolve and validate the manifest
/// 2. Create a workspace
/// 3. Fetch the artifact and config trees, overlay config into artifact
/// 4. Run the build command and build the image
/// 5. Replace the running container
/// 6. Prune the build cache and destroy the workspace, whatever happened
///    in 3-5
///
/// Stages run one after another; the first error aborts the rest.
pub struct Orchestrator<'a> {
    fetcher: &'a dyn SourceFetcher,
    engine: &'a dyn ContainerEngine,
    runner: &'a dyn CommandRunner,
    ids: &'a dyn IdGenerator,
    merge: &'a dyn MergeStrategy,
    workspace_root: PathBuf,
    strict_build: bool,
    prune_build_cache: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        fetcher: &'a dyn SourceFetcher,
        engine: &'a dyn ContainerEngine,
        runner: &'a dyn CommandRunner,
        ids: &'a dyn IdGenerator,
    ) -> Self {
        Self {
            fetcher,
            engine,
            runner,
            ids,
            merge: &ShallowOverlay,
            workspace_root: std::env::temp_dir(),
            strict_build: false,
            prune_build_cache: true,
        }
    }

    pub fn with_merge_strategy(mut self, merge: &'a dyn MergeStrategy) -> Self {
        self.merge = merge;
        self
    }

    /// Directory under which per-run workspaces are created.
    pub fn with_workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = root;
        self
    }

    pub fn with_strict_build(mut self, strict: bool) -> Self {
        self.strict_build = strict;
        self
    }

    pub fn with_prune_build_cache(mut self, prune: bool) -> Self {
        self.prune_build_cache = prune;
        self
    }

    /// Resolve `manifest_text` and deploy it.
    ///
    /// An invalid manifest fails before any workspace, fetch or engine call.
    pub async fn run(&self, manifest_text: &str) -> Result<DeploymentReport, PipelineError> {
        let manifest = manifest::resolve(manifest_text, &self.ids.next_id())?;
        self.deploy(&manifest).await
    }

    /// Deploy an already resolved manifest.
    pub async fn deploy(
        &self,
        manifest: &DeploymentManifest,
    ) -> Result<DeploymentReport, PipelineError> {
        let start = Instant::now();
        tracing::info!(
            deployment = %manifest.name,
            image = %manifest.image.image_ref(),
            container = %manifest.deploy.name,
            "Starting deployment"
        );

        let workspace = Workspace::create(&self.workspace_root, self.ids).await?;
        let result = self.stages(&workspace, manifest, start).await;

        if self.prune_build_cache
            && let Err(e) = self.engine.prune_build_cache().await
        {
            tracing::warn!(error = %e, "Build cache prune failed");
        }
        if let Err(e) = workspace.destroy().await {
            tracing::warn!(error = %e, "Failed to remove workdir");
        }

        match &result {
            Ok(report) => tracing::info!(
                deployment = %report.deployment,
                container_id = %report.container_id,
                replaced = report.replaced.len(),
                assemble_ms = report.timings.assemble_ms,
                build_ms = report.timings.build_ms,
                deploy_ms = report.timings.deploy_ms,
                total_ms = report.timings.total_ms,
                "Done!"
            ),
            Err(e) => tracing::error!(deployment = %manifest.name, error = %e, "Deployment failed"),
        }
        result
    }

    async fn stages(
        &self,
        workspace: &Workspace,
        manifest: &DeploymentManifest,
        start: Instant,
    ) -> Result<DeploymentReport, PipelineError> {
        let mut timings = StageTimings::default();

        let stage_start = Instant::now();
        let artifact_root = SourceAssembler::new(self.fetcher, self.merge, self.ids)
            .assemble(workspace, manifest)
            .await?;
        timings.assemble_ms = stage_start.elapsed().as_millis() as u64;

        let stage_start = Instant::now();
        let image = BuildExecutor::new(self.runner, self.engine)
            .with_strict(self.strict_build)
            .build(&artifact_root, manifest)
            .await?;
        timings.build_ms = stage_start.elapsed().as_millis() as u64;

        let stage_start = Instant::now();
        let outcome = DeploymentReplacer::new(self.engine)
            .replace(manifest, &image)
            .await?;
        timings.deploy_ms = stage_start.elapsed().as_millis() as u64;
        timings.total_ms = start.elapsed().as_millis() as u64;

        Ok(DeploymentReport {
            deployment: manifest.name.clone(),
            image,
            container_name: manifest.deploy.name.clone(),
            container_id: outcome.container_id,
            replaced: outcome.replaced,
            network_created: outcome.network_created,
            run_flags: outcome.run_flags,
            timings,
        })
    }
}
