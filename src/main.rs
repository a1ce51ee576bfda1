use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use saga_gateway::{listen, Gateway, GatewayConfig, LocalBus, ShutdownCoordinator};
use saga_store::{Database, EventLogRepo, JobRepo};
use saga_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

/// Realtime event gateway for novel-generation jobs.
#[derive(Debug, Parser)]
#[command(name = "saga-gateway", version)]
struct Cli {
    /// JSON config file, deep-merged over defaults.
    #[arg(long, env = "SAGA_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// SQLite database holding the event log and job snapshots.
    #[arg(long)]
    database: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.database {
            config.database_path = path.to_string_lossy().into_owned();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = GatewayConfig::load(cli.config.as_deref()).context("loading config")?;
    cli.apply(&mut config);

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: config.log_level.parse().unwrap_or(Level::INFO),
        module_levels: Vec::new(),
        format: config.log_format,
    });

    let db_path = Path::new(&config.database_path);
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating database directory {}", dir.display()))?;
    }
    let db = Database::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let bus = LocalBus::new(config.bus_capacity);
    let gateway = Gateway::new(
        config,
        Arc::new(EventLogRepo::new(db.clone())),
        Arc::new(JobRepo::new(db)),
        telemetry.metrics(),
    );
    let tasks = gateway.start(bus.subscribe());

    let coordinator = ShutdownCoordinator::new();
    let server = listen(gateway.clone(), bus, coordinator.token())
        .await
        .context("binding listener")?;
    tracing::info!(port = server.port(), "saga gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    tracing::info!("shutting down");

    let mut handles = tasks.into_handles();
    handles.push(server.into_task());
    coordinator.graceful_shutdown(&gateway, handles, None).await;
    Ok(())
}
