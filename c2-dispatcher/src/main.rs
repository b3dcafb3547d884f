//! C2 emulation command channel
//!
//! Listens for datagrams on the configured UDP port and answers them through
//! the activation-gated command dispatcher until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use c2emu_common::AgentConfig;
use c2emu_dispatcher::{listener, CommandDispatcher};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "c2-dispatcher", version)]
#[command(about = "Activation-gated UDP command channel")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Activation secret
    #[arg(long)]
    act_code: Option<String>,

    /// Directory receiving pushed files
    #[arg(long)]
    file_dir: Option<PathBuf>,

    /// Largest datagram accepted, in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        let dispatcher = &mut config.dispatcher;
        if let Some(port) = self.port {
            dispatcher.udp_port = port;
        }
        if let Some(code) = &self.act_code {
            dispatcher.activation_code = code.clone();
        }
        if let Some(dir) = &self.file_dir {
            dispatcher.file_dir = dir.clone();
        }
        if let Some(size) = self.buffer_size {
            dispatcher.buffer_size = size;
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
    let settings = config.dispatcher;
    settings.validate()?;

    let dispatcher = Arc::new(CommandDispatcher::new(
        settings.activation_code.clone(),
        settings.file_dir.clone(),
    ));
    let socket = listener::bind(settings.udp_port)
        .await
        .with_context(|| format!("binding UDP port {}", settings.udp_port))?;

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

    info!(
        port = settings.udp_port,
        file_dir = %settings.file_dir.display(),
        "Starting command channel"
    );
    listener::serve(socket, dispatcher, settings.buffer_size, cancel).await?;
    Ok(())
}
