use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::PipelineError;

const CONFIG_FILE: &str = "locdeploy.toml";

/// Runner settings: which tools to drive and how strictly. Unrelated to the
/// per-deployment manifest.
#[derive(Debug, Default, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// How the container engine is reached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineDriver {
    /// Docker Engine API over the local socket.
    #[default]
    Api,
    /// Only the `bin` command line.
    Cli,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub driver: EngineDriver,
    /// Used for every call with the `cli` driver, and for `run` and
    /// build cache pruning with `api`.
    #[serde(default = "default_engine_bin")]
    pub bin: String,
    #[serde(default = "default_true")]
    pub prune_build_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            driver: EngineDriver::default(),
            bin: default_engine_bin(),
            prune_build_cache: true,
        }
    }
}

fn default_engine_bin() -> String {
    "docker".into()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_git_bin")]
    pub git_bin: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            git_bin: default_git_bin(),
        }
    }
}

fn default_git_bin() -> String {
    "git".into()
}

#[derive(Debug, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Treat a failing build command as fatal.
    #[serde(default)]
    pub strict: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            strict: false,
        }
    }
}

fn default_shell() -> String {
    "bash".into()
}

#[derive(Debug, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound for every external command. Unset means wait forever.
    pub command_timeout_secs: Option<u64>,
    /// Where workspaces are created. Defaults to the system temp dir.
    pub workspace_root: Option<PathBuf>,
}

impl RunnerConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(PipelineError::Io)?;
        Self::parse(&content)
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, PipelineError> {
        toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load `explicit` if given, otherwise the first of `./locdeploy.toml`
    /// and `~/.config/locdeploy/locdeploy.toml` that exists, otherwise
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, PipelineError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::search_paths().into_iter().find(|p| p.is_file()) {
            Some(path) => {
                tracing::debug!(config = %path.display(), "Loading runner config");
                Self::from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("locdeploy").join(CONFIG_FILE));
        }
        paths
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.runtime.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.runtime
            .workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
