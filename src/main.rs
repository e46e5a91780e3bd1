//! faxbridge - fax gateway between HylaFAX and FreeSWITCH
//!
//! Two entry points share one configuration file:
//! - `serve` runs the virtual modems and receives faxes from the switch
//! - `send` is called by the HylaFAX scheduler to transmit one job

mod config;
mod esl;
mod fallback;
mod hylafax;
mod models;
mod send;
mod server;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use config::GatewayConfig;
use server::{EventSocketServer, ServerContext};

/// Time given to running sessions to hang up after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "faxbridge", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the inbound daemon and the virtual modems
    Serve,
    /// Transmit a queued job (called by the scheduler)
    Send {
        /// Modem the scheduler assigned to the job
        #[arg(short = 'm', value_name = "DEVICE")]
        device: String,

        /// Queue files; only the first is sent
        #[arg(required = true)]
        qfiles: Vec<PathBuf>,
    },
}

fn main() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("faxbridge=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = GatewayConfig::load(cli.config.as_deref()).context("Loading configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Starting runtime")?;

    match cli.command {
        Command::Serve => runtime.block_on(serve(config)).map(|()| 0),
        Command::Send { device, qfiles } => runtime.block_on(transmit(config, device, qfiles)),
    }
}

async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!("Starting faxbridge {}", env!("CARGO_PKG_VERSION"));

    let ctx = ServerContext::start(config).context("Starting virtual modems")?;
    let server = EventSocketServer::bind(ctx.clone())
        .await
        .context("Binding event socket listener")?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = server.run() => {
            ctx.shutdown().await;
            result.context("Event socket listener failed")?;
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
            ctx.shutdown().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
            ctx.shutdown().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }
    Ok(())
}

async fn transmit(config: GatewayConfig, device: String, qfiles: Vec<PathBuf>) -> anyhow::Result<i32> {
    let kill = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let on_signal = kill.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, aborting transmission"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, aborting transmission"),
        }
        on_signal.cancel();
    });

    let outcome = send::run_send(&config, &device, &qfiles, kill).await;
    Ok(outcome.code())
}
