use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::naming::IdGenerator;

/// Ephemeral working directory owned by exactly one run.
///
/// Layout:
/// ```text
/// root/<token>/
///   <image.name>/      -- artifact checkout
///   config-<token>/    -- config checkout, emptied by the overlay
/// ```
///
/// Call [`Workspace::destroy`] when the run ends. If that never happens
/// (panic, cancelled future) the directory is removed on drop instead.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    destroyed: bool,
}

impl Workspace {
    /// Create `root/<token>`. A name collision is an error, not retried.
    pub async fn create(root: &Path, ids: &dyn IdGenerator) -> Result<Self, PipelineError> {
        let path = root.join(ids.next_id());
        tokio::fs::create_dir_all(root).await?;
        tokio::fs::create_dir(&path).await?;
        tracing::info!(workdir = %path.display(), "Created workdir");
        Ok(Self {
            path,
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate a fresh, empty subdirectory next to the artifact checkout.
    pub async fn scratch_dir(&self, ids: &dyn IdGenerator) -> Result<PathBuf, PipelineError> {
        let dir = self.path.join(format!("config-{}", ids.next_id()));
        tokio::fs::create_dir(&dir).await?;
        Ok(dir)
    }

    /// Remove the directory tree.
    pub async fn destroy(mut self) -> Result<(), PipelineError> {
        self.destroyed = true;
        tracing::info!(workdir = %self.path.display(), "Removing workdir");
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(workdir = %self.path.display(), error = %e, "Failed to remove workdir on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::SequenceIdGenerator;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_and_destroys_directory() {
        let tmp = TempDir::new().unwrap();
        let ids = SequenceIdGenerator::new(10_000);

        let ws = Workspace::create(tmp.path(), &ids).await.unwrap();
        let path = ws.path().to_path_buf();
        assert_eq!(path, tmp.path().join("10000"));
        assert!(path.is_dir());

        std::fs::write(path.join("file.txt"), "x").unwrap();
        ws.destroy().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_directory() {
        let tmp = TempDir::new().unwrap();
        let ids = SequenceIdGenerator::new(1);
        let path = {
            let ws = Workspace::create(tmp.path(), &ids).await.unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn collision_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("7")).unwrap();
        let ids = SequenceIdGenerator::new(7);
        let err = Workspace::create(tmp.path(), &ids).await.unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }

    #[tokio::test]
    async fn scratch_dirs_live_inside_workspace() {
        let tmp = TempDir::new().unwrap();
        let ids = SequenceIdGenerator::new(1);
        let ws = Workspace::create(tmp.path(), &ids).await.unwrap();
        let scratch = ws.scratch_dir(&ids).await.unwrap();
        assert_eq!(scratch, ws.path().join("config-2"));
        assert!(scratch.is_dir());
    }
}
