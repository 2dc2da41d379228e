use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("manifest is missing required field(s): {}", fields.join(", "))]
    ManifestValidation { fields: Vec<String> },

    #[error("invalid manifest field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("failed to fetch {repo}@{tag}: {reason}")]
    SourceFetch {
        repo: String,
        tag: String,
        reason: String,
    },

    #[error("config overlay failed: {0}")]
    Overlay(String),

    #[error("build command `{command}` exited with {status}")]
    BuildCommand { command: String, status: String },

    #[error("image build failed: {0}")]
    ImageBuild(String),

    #[error("container engine: {0}")]
    Engine(String),

    #[error("container engine API: {0}")]
    EngineApi(#[from] bollard::errors::Error),

    #[error("network `{network}` could not be ensured: {reason}")]
    Network { network: String, reason: String },

    #[error("could not replace existing container `{name}`: {reason}")]
    ContainerReplace { name: String, reason: String },

    #[error("could not launch container `{name}`: {reason}")]
    ContainerLaunch { name: String, reason: String },

    #[error("`{program}` did not finish within {secs}s")]
    CommandTimeout { program: String, secs: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
