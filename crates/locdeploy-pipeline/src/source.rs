use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio::process::Command;

use crate::error::PipelineError;
use crate::manifest::DeploymentManifest;
use crate::naming::IdGenerator;
use crate::process::execute;
use crate::workspace::Workspace;

/// Fetches a repository at a given revision into a local directory.
///
/// `dest` exists and is empty when this is called.
pub trait SourceFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        repo: &'a str,
        tag: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}

/// Full (non-shallow) checkout through the `git` CLI.
pub struct GitFetcher {
    git_bin: String,
    timeout: Option<Duration>,
}

impl GitFetcher {
    pub fn new() -> Self {
        Self {
            git_bin: "git".into(),
            timeout: None,
        }
    }

    pub fn with_bin(mut self, path: impl Into<String>) -> Self {
        self.git_bin = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch<'a>(
        &'a self,
        repo: &'a str,
        tag: &'a str,
        dest: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let fetch_error = |reason: String| PipelineError::SourceFetch {
                repo: repo.to_string(),
                tag: tag.to_string(),
                reason,
            };

            let mut cmd = Command::new(&self.git_bin);
            cmd.args(["-c", "advice.detachedHead=false", "clone", "--branch", tag, "--"])
                .arg(repo)
                .arg(dest);

            let outcome = execute(cmd, &self.git_bin, self.timeout)
                .await
                .map_err(|e| fetch_error(e.to_string()))?;
            if !outcome.success() {
                return Err(fetch_error(format!(
                    "git clone failed ({}): {}",
                    outcome.status_text(),
                    outcome.stderr_tail()
                )));
            }
            Ok(())
        })
    }
}

/// How a fetched config tree is combined with the artifact tree.
pub trait MergeStrategy: Send + Sync {
    fn merge<'a>(
        &'a self,
        from: &'a Path,
        into: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}

/// Moves each top-level entry of `from` into `into`.
///
/// Not recursive: a directory in `from` replaces a same-named directory in
/// `into` wholesale. Existing entries are removed first, so config wins.
#[derive(Debug, Default)]
pub struct ShallowOverlay;

impl MergeStrategy for ShallowOverlay {
    fn merge<'a>(
        &'a self,
        from: &'a Path,
        into: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let overlay_error = |what: &str, path: &Path, e: std::io::Error| {
                PipelineError::Overlay(format!("{what} {}: {e}", path.display()))
            };

            let mut entries = tokio::fs::read_dir(from)
                .await
                .map_err(|e| overlay_error("cannot read", from, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| overlay_error("cannot read", from, e))?
            {
                let source = entry.path();
                let target = into.join(entry.file_name());

                if let Ok(meta) = tokio::fs::symlink_metadata(&target).await {
                    let removed = if meta.is_dir() {
                        tokio::fs::remove_dir_all(&target).await
                    } else {
                        tokio::fs::remove_file(&target).await
                    };
                    removed.map_err(|e| overlay_error("cannot replace", &target, e))?;
                    tracing::debug!(path = %target.display(), "Overwriting existing entry");
                }

                tokio::fs::rename(&source, &target)
                    .await
                    .map_err(|e| overlay_error("cannot move", &source, e))?;
            }
            Ok(())
        })
    }
}

/// Fetches the artifact and config trees and overlays one onto the other.
pub struct SourceAssembler<'a> {
    fetcher: &'a dyn SourceFetcher,
    merge: &'a dyn MergeStrategy,
    ids: &'a dyn IdGenerator,
}

impl<'a> SourceAssembler<'a> {
    pub fn new(
        fetcher: &'a dyn SourceFetcher,
        merge: &'a dyn MergeStrategy,
        ids: &'a dyn IdGenerator,
    ) -> Self {
        Self {
            fetcher,
            merge,
            ids,
        }
    }

    /// Returns the artifact root, with the config tree merged in.
    pub async fn assemble(
        &self,
        workspace: &Workspace,
        manifest: &DeploymentManifest,
    ) -> Result<PathBuf, PipelineError> {
        let artifact_root = workspace.path().join(&manifest.image.name);
        tokio::fs::create_dir_all(&artifact_root).await?;

        tracing::info!(
            repo = %manifest.artifact.repo,
            tag = %manifest.artifact.tag,
            "Cloning artifact repo"
        );
        self.fetcher
            .fetch(&manifest.artifact.repo, &manifest.artifact.tag, &artifact_root)
            .await?;

        let config_destination = artifact_root.join(&manifest.config.destination_path);
        tokio::fs::create_dir_all(&config_destination).await?;

        // Never clone into the artifact tree directly: the target would not be empty.
        let staging = workspace.scratch_dir(self.ids).await?;
        tracing::info!(
            repo = %manifest.config.repo,
            tag = %manifest.config.tag,
            "Cloning config repo"
        );
        self.fetcher
            .fetch(&manifest.config.repo, &manifest.config.tag, &staging)
            .await?;

        tracing::info!(
            destination = %config_destination.display(),
            "Merging config into artifact"
        );
        self.merge.merge(&staging, &config_destination).await?;

        Ok(artifact_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::resolve;
    use crate::naming::SequenceIdGenerator;
    use crate::stub::StubFetcher;
    use tempfile::TempDir;

    fn manifest() -> DeploymentManifest {
        resolve(
            r#"
artifact: {repo: R1, tag: v1, buildCmd: make}
config: {repo: R2, destinationPath: conf/app}
image: {name: app}
"#,
            "1",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn overlay_moves_entries_and_overwrites_collisions() {
        let tmp = TempDir::new().unwrap();
        let from = tmp.path().join("from");
        let into = tmp.path().join("into");
        std::fs::create_dir_all(from.join("nested")).unwrap();
        std::fs::create_dir_all(into.join("nested")).unwrap();
        std::fs::write(from.join("app.yml"), "config").unwrap();
        std::fs::write(from.join("nested/new.txt"), "new").unwrap();
        std::fs::write(into.join("app.yml"), "artifact").unwrap();
        std::fs::write(into.join("nested/old.txt"), "old").unwrap();
        std::fs::write(into.join("keep.txt"), "keep").unwrap();

        ShallowOverlay.merge(&from, &into).await.unwrap();

        assert_eq!(std::fs::read_to_string(into.join("app.yml")).unwrap(), "config");
        assert!(into.join("nested/new.txt").exists());
        // shallow: the whole directory was replaced
        assert!(!into.join("nested/old.txt").exists());
        assert!(into.join("keep.txt").exists());
        assert_eq!(std::fs::read_dir(&from).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn assembles_artifact_with_config_overlay() {
        let tmp = TempDir::new().unwrap();
        let ids = SequenceIdGenerator::new(100);
        let ws = Workspace::create(tmp.path(), &ids).await.unwrap();

        let fetcher = StubFetcher::new()
            .with_file("R1", "Dockerfile", "FROM scratch")
            .with_file("R1", "conf/app/settings.yml", "default")
            .with_file("R2", "settings.yml", "override");
        let assembler = SourceAssembler::new(&fetcher, &ShallowOverlay, &ids);

        let root = assembler.assemble(&ws, &manifest()).await.unwrap();

        assert_eq!(root, ws.path().join("app"));
        assert!(root.join("Dockerfile").exists());
        assert_eq!(
            std::fs::read_to_string(root.join("conf/app/settings.yml")).unwrap(),
            "override"
        );
        assert_eq!(
            fetcher.fetched(),
            vec![("R1".to_string(), "v1".to_string()), ("R2".to_string(), "master".to_string())]
        );
    }

    #[tokio::test]
    async fn fetch_failure_names_repo_and_tag() {
        let tmp = TempDir::new().unwrap();
        let ids = SequenceIdGenerator::new(1);
        let ws = Workspace::create(tmp.path(), &ids).await.unwrap();
        let fetcher = StubFetcher::new().failing("R2");
        let assembler = SourceAssembler::new(&fetcher, &ShallowOverlay, &ids);

        let err = assembler.assemble(&ws, &manifest()).await.unwrap_err();
        match err {
            PipelineError::SourceFetch { repo, tag, .. } => {
                assert_eq!(repo, "R2");
                assert_eq!(tag, "master");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn git_fetcher_reports_missing_binary() {
        let tmp = TempDir::new().unwrap();
        let fetcher = GitFetcher::new().with_bin("/nonexistent/git");
        let err = fetcher.fetch("R1", "main", tmp.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceFetch { .. }));
    }
}
