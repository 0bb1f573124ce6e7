//! Command-line interface for lockmirror.

mod npmrc;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use lockmirror_core::MirrorConfig;
use lockmirror_engine::{Fetcher, Reconciler, RemoveDerivedLockfile};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lockmirror")]
#[command(about = "Mirror lock file dependencies into a local directory for offline installs")]
#[command(version)]
struct Cli {
    /// Lock file to reconcile (default: package-lock.json)
    #[arg(long)]
    lockfile: Option<PathBuf>,

    /// Mirror directory, relative to the lock file's directory (overrides
    /// npm-offline-mirror from npm config)
    #[arg(long)]
    mirror: Option<PathBuf>,

    /// Settings file path
    #[arg(long, env = "LOCKMIRROR_CONFIG", default_value = settings::CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .without_time(),
        )
        .init();

    let settings = settings::load(&cli.config)?;
    let lockfile = cli.lockfile.unwrap_or(settings.lockfile);
    let project_dir = lockfile
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let registries = npmrc::load(project_dir).await?;

    let mut config = MirrorConfig::from_settings(registries);
    if let Some(mirror) = cli.mirror {
        config = config.with_mirror_path(mirror);
    }

    let hook = match settings.derived_lockfile {
        Some(path) => RemoveDerivedLockfile::new(path),
        None => RemoveDerivedLockfile::for_lockfile(&lockfile),
    };

    let fetcher = Fetcher::with_timeout(settings.timeout_secs.map(Duration::from_secs))
        .context("failed to create HTTP client")?;

    let report = Reconciler::new(config, fetcher)
        .with_hook(hook)
        .run(&lockfile)
        .await?;

    if !report.failed.is_empty() {
        tracing::warn!(
            "{} package(s) could not be mirrored and were left unchanged",
            report.failed.len()
        );
    }

    Ok(())
}
