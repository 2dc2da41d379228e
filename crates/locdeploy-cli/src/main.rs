use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use locdeploy_pipeline::{
    ContainerEngine, DockerApi, DockerCli, EngineDriver, GitFetcher, ManifestResolver,
    Orchestrator, RandomIdGenerator, RunnerConfig, ShellRunner,
};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(
    name = "locdeploy",
    version,
    about = "locdeploy: fetch, build and (re)launch a container from a deployment manifest"
)]
struct Cli {
    /// Runner config file (default: ./locdeploy.toml, then ~/.config/locdeploy/locdeploy.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a manifest: fetch, overlay config, build, replace container
    Deploy {
        /// Path to the deployment manifest file
        #[arg(short, long)]
        manifest: PathBuf,

        /// Fail when the artifact build command exits non-zero
        #[arg(long)]
        strict_build: bool,
    },
    /// Resolve and validate a manifest, then print it with defaults applied
    Validate {
        /// Path to the deployment manifest file
        #[arg(short, long)]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Deploy {
            manifest,
            strict_build,
        } => deploy(cli.config.as_deref(), &manifest, strict_build).await,
        Commands::Validate { manifest } => validate(&manifest).await,
    }
}

// Logs go to stderr; stdout carries only command output.
fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_env("LOCDEPLOY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn deploy(config: Option<&Path>, manifest_path: &Path, strict_build: bool) -> Result<()> {
    let config = RunnerConfig::load(config).context("failed to load runner config")?;
    let timeout = config.command_timeout();

    let ids = Arc::new(RandomIdGenerator::new());

    let manifest = ManifestResolver::new(ids.clone())
        .resolve_file(manifest_path)
        .await
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;

    let fetcher = GitFetcher::new()
        .with_bin(&config.fetch.git_bin)
        .with_timeout(timeout);
    let runner = ShellRunner::new()
        .with_shell(&config.build.shell)
        .with_timeout(timeout);
    let engine: Box<dyn ContainerEngine> = match config.engine.driver {
        EngineDriver::Api => Box::new(
            DockerApi::connect()
                .context("failed to connect to the container engine")?
                .with_bin(&config.engine.bin)
                .with_timeout(timeout),
        ),
        EngineDriver::Cli => Box::new(
            DockerCli::new()
                .with_bin(&config.engine.bin)
                .with_timeout(timeout),
        ),
    };

    let report = Orchestrator::new(&fetcher, engine.as_ref(), &runner, ids.as_ref())
        .with_workspace_root(config.workspace_root())
        .with_strict_build(strict_build || config.build.strict)
        .with_prune_build_cache(config.engine.prune_build_cache)
        .deploy(&manifest)
        .await
        .with_context(|| format!("deployment `{}` failed", manifest.name))?;

    println!("{}", report.container_id);
    Ok(())
}

async fn validate(manifest_path: &Path) -> Result<()> {
    let resolver = ManifestResolver::new(Arc::new(RandomIdGenerator::new()));
    let manifest = resolver
        .resolve_file(manifest_path)
        .await
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;

    let rendered =
        serde_yaml::to_string(manifest.document()).context("failed to render manifest")?;
    print!("{rendered}");
    tracing::info!(
        image = %manifest.image.image_ref(),
        container = %manifest.deploy.name,
        "Manifest is valid"
    );
    Ok(())
}
