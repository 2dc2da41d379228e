use std::path::Path;

use crate::engine::ContainerEngine;
use crate::error::PipelineError;
use crate::manifest::{DeploymentManifest, ImageRef};
use crate::process::CommandRunner;

/// Runs the artifact's build command, then builds the container image.
pub struct BuildExecutor<'a> {
    runner: &'a dyn CommandRunner,
    engine: &'a dyn ContainerEngine,
    /// Fail the run when the build command exits non-zero.
    strict: bool,
}

impl<'a> BuildExecutor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, engine: &'a dyn ContainerEngine) -> Self {
        Self {
            runner,
            engine,
            strict: false,
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub async fn build(
        &self,
        artifact_root: &Path,
        manifest: &DeploymentManifest,
    ) -> Result<ImageRef, PipelineError> {
        let command = &manifest.artifact.build_cmd;
        tracing::info!(command = %command, "Executing build command");
        let outcome = self.runner.run_shell(command, artifact_root).await?;
        tracing::debug!(output = %outcome.stdout, "Build command output");

        if !outcome.success() {
            if self.strict {
                return Err(PipelineError::BuildCommand {
                    command: command.clone(),
                    status: outcome.status_text(),
                });
            }
            tracing::warn!(
                command = %command,
                status = %outcome.status_text(),
                stderr = %outcome.stderr_tail(),
                "Build command failed; continuing with image build"
            );
        }

        let image = manifest.image.image_ref();
        let tag = image.to_string();
        let dockerfile = artifact_root.join(&manifest.artifact.docker_file);
        tracing::info!(image = %tag, dockerfile = %dockerfile.display(), "Building image");
        self.engine
            .build_image(artifact_root, &dockerfile, &tag)
            .await
            .map_err(|e| PipelineError::ImageBuild(e.to_string()))?;

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::resolve;
    use crate::stub::{EngineCall, EngineOp, RecordingEngine, StubRunner};

    fn manifest() -> DeploymentManifest {
        resolve(
            r#"
artifact: {repo: R1, buildCmd: "make dist", dockerFile: docker/Dockerfile}
config: {repo: R2, destinationPath: conf}
image: {name: app, version: "2.0"}
"#,
            "1",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn runs_build_command_then_builds_image() {
        let runner = StubRunner::succeeding();
        let engine = RecordingEngine::new();
        let root = Path::new("/work/app");

        let image = BuildExecutor::new(&runner, &engine)
            .build(root, &manifest())
            .await
            .unwrap();

        assert_eq!(image.to_string(), "app:2.0");
        assert_eq!(runner.calls(), vec![("make dist".to_string(), root.to_path_buf())]);
        assert_eq!(
            engine.calls(),
            vec![EngineCall::BuildImage {
                context: root.to_path_buf(),
                dockerfile: root.join("docker/Dockerfile"),
                tag: "app:2.0".into(),
            }]
        );
    }

    #[tokio::test]
    async fn lenient_mode_continues_after_failed_build_command() {
        let runner = StubRunner::with_exit_code(2);
        let engine = RecordingEngine::new();

        let image = BuildExecutor::new(&runner, &engine)
            .build(Path::new("/work/app"), &manifest())
            .await
            .unwrap();

        assert_eq!(image.to_string(), "app:2.0");
        assert_eq!(engine.calls().len(), 1);
    }

    #[tokio::test]
    async fn strict_mode_stops_before_image_build() {
        let runner = StubRunner::with_exit_code(2);
        let engine = RecordingEngine::new();

        let err = BuildExecutor::new(&runner, &engine)
            .with_strict(true)
            .build(Path::new("/work/app"), &manifest())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::BuildCommand { .. }));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn image_build_failure_is_fatal() {
        let runner = StubRunner::succeeding();
        let engine = RecordingEngine::new().failing(EngineOp::BuildImage);

        let err = BuildExecutor::new(&runner, &engine)
            .build(Path::new("/work/app"), &manifest())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::ImageBuild(_)));
    }
}
