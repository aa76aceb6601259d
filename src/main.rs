//! Tabshell command line.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use tabshell::bridge::BrowsingContext;
use tabshell::common::error::Result as ShellResult;
use tabshell::common::{Clock, SystemClock};
use tabshell::config::{get_config_path, load_and_validate, Config};
use tabshell::shell::{
    AssetCache, AssumeOnline, Connectivity, FrameLauncher, HttpFetcher, HttpWarmingLauncher,
    RouterSettings, ShellOutcome, ShellRouter, StaticConnectivity,
};
use tabshell::storage::{FileStore, HostEnvironment, KeyValueStore, StorageRuntime};
use tabshell::update::{
    BackoffTracker, CheckerSettings, HttpManifestSource, UpdateStateStore, VersionChecker,
};

#[derive(Debug, Parser)]
#[command(name = "tabshell", version, about)]
struct Cli {
    /// Config file (defaults to $TABSHELL_CONFIG or tabshell.conf)
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decide where a new tab goes, then run the background version check
    Open {
        /// Report the browser as offline
        #[arg(long)]
        offline: bool,
        /// Skip the background version check
        #[arg(long)]
        no_check: bool,
    },
    /// Check the remote version now
    Check,
    /// Print the persisted update state
    State,
    /// Clear all update keys
    Reset,
}

/// Everything one tab needs, wired from config.
struct Shell {
    config: Config,
    runtime: StorageRuntime,
    launcher: Arc<dyn FrameLauncher>,
}

impl Shell {
    async fn new(config: Config) -> ShellResult<Self> {
        let file_store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&config.storage.path));
        let runtime = StorageRuntime::new(
            HostEnvironment::extension(file_store),
            config.storage.handshake_timeout(),
        );

        let fetcher = Arc::new(HttpFetcher::new(config.update.precache_timeout())?);
        let cache = Arc::new(
            AssetCache::open(
                config.remote_url()?,
                config.shell.manifest_path.clone(),
                fetcher,
                &config.storage.cache_dir,
            )
            .await?,
        );
        let launcher: Arc<dyn FrameLauncher> = Arc::new(HttpWarmingLauncher::new(cache));

        Ok(Self {
            config,
            runtime,
            launcher,
        })
    }

    async fn state(&self) -> UpdateStateStore {
        UpdateStateStore::new(self.runtime.store().await)
    }

    async fn router(&self, connectivity: Arc<dyn Connectivity>) -> ShellResult<ShellRouter> {
        let store = self.runtime.store().await;
        let state = UpdateStateStore::new(Arc::clone(&store));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backoff = BackoffTracker::with_limits(
            state.clone(),
            clock,
            self.config.update.max_failures,
            self.config.update.backoff_window(),
        );
        let settings = RouterSettings {
            local_entry: self.config.shell.local_entry.clone(),
            remote_url: self.config.remote_url()?,
            remote_load_timeout: self.config.remote_load_timeout(),
            shell: BrowsingContext::new("chrome-extension://tabshell"),
        };
        Ok(ShellRouter::new(
            settings,
            state,
            backoff,
            connectivity,
            Arc::clone(&self.launcher),
            store,
        ))
    }

    async fn checker(&self) -> ShellResult<Arc<VersionChecker>> {
        let manifest = HttpManifestSource::new(
            self.config.manifest_url()?,
            self.config.update.manifest_timeout(),
        )?;
        let mut settings =
            CheckerSettings::new(self.config.bundled_version(), self.config.remote_url()?);
        settings.check_delay = self.config.update.check_delay();
        settings.precache_timeout = self.config.update.precache_timeout();
        settings.teardown_grace = self.config.update.teardown_grace();

        Ok(Arc::new(VersionChecker::new(
            settings,
            Arc::new(manifest),
            Arc::clone(&self.launcher),
            self.state().await,
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(get_config_path);
    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        "Tabshell v{} (bundled shell {})",
        env!("CARGO_PKG_VERSION"),
        config.bundled_version()
    );
    info!("  Remote origin: {}", config.shell.remote_origin);
    info!("  Storage: {}", config.storage.path);
    info!("  Asset cache: {}", config.storage.cache_dir);

    let shell = Shell::new(config).await?;
    info!("  Storage strategy: {}", shell.runtime.strategy());

    match cli.command {
        Command::Open { offline, no_check } => {
            let connectivity: Arc<dyn Connectivity> = if offline {
                Arc::new(StaticConnectivity(false))
            } else {
                Arc::new(AssumeOnline)
            };
            let router = shell.router(connectivity).await?;
            let outcome = router.open().await;
            println!("{}", outcome);

            if !no_check {
                let embedded = false;
                if let Some(task) = shell.checker().await?.schedule(embedded) {
                    let result = task.await?;
                    println!("{}", result);
                }
            }

            if let ShellOutcome::Remote(session) = outcome {
                session.close().await;
            }
        }
        Command::Check => {
            let outcome = shell.checker().await?.check().await;
            println!("{}", outcome);
        }
        Command::State => {
            let state = shell.state().await.load().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Reset => {
            shell.state().await.reset().await?;
            println!("Update state cleared");
        }
    }

    shell.runtime.shutdown();
    Ok(())
}
