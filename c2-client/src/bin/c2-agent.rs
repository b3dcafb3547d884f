//! C2 emulation agent
//!
//! Registers with the controller, keeps the report/poll loop running in the
//! background and executes received tasks one at a time until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use c2emu_client::{C2Client, HttpTransport, TaskRunner};
use c2emu_common::{AgentConfig, TaskRecord};
use clap::Parser;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the runner looks for a queued task when idle.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "c2-agent", version)]
#[command(about = "C2 emulation agent: register, poll tasks, report results")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent identity announced to the controller
    #[arg(long)]
    id: Option<String>,

    /// Controller host or IP
    #[arg(long)]
    c2_host: Option<String>,

    /// Controller HTTP port
    #[arg(long)]
    c2_port: Option<u16>,

    /// Own address reported at registration
    #[arg(long)]
    own_ip: Option<String>,

    /// Directory for downloaded files
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Seconds between report/poll iterations
    #[arg(long)]
    interval: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(id) = &self.id {
            config.agent.id = id.clone();
        }
        if let Some(host) = &self.c2_host {
            config.controller.host = host.clone();
        }
        if let Some(port) = self.c2_port {
            config.controller.port = port;
        }
        if let Some(ip) = &self.own_ip {
            config.agent.own_ip = ip.clone();
        }
        if let Some(dir) = &self.download_dir {
            config.agent.download_dir = dir.clone();
        }
        if let Some(secs) = self.interval {
            config.agent.report_interval_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    let transport = HttpTransport::new(Duration::from_secs(config.controller.request_timeout_secs))
        .context("building HTTP transport")?;
    let client = Arc::new(C2Client::new(&config, Arc::new(transport))?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for Ctrl-C: {}", err);
                return;
            }
            info!("shutdown requested");
            cancel.cancel();
        });
    }

    info!("Starting C2 agent: {}", client.id());
    let seeds = vec![TaskRecord::register_seed(0)];
    let loop_handle = client.spawn(cancel.clone());
    let mut runner = TaskRunner::new(Arc::clone(&client));

    while !cancel.is_cancelled() {
        if !client.is_connected() {
            if !client.register(&seeds).await {
                warn!("registration failed, retrying in {:?}", client.report_interval());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(client.report_interval()) => {}
                }
            }
            continue;
        }

        if runner.run_next().await.is_none() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(IDLE_POLL) => {}
            }
        }
    }

    if let Err(err) = loop_handle.await {
        error!("transport loop ended abnormally: {}", err);
    }
    let summary = runner.store().summary();
    info!(
        total = summary.counts.total,
        finished = summary.counts.finish,
        errors = summary.counts.error,
        "C2 agent stopped"
    );
    Ok(())
}
