//! wcap - entry point.
//!
//! Parses the command line, loads the optional configuration file and runs
//! one tunnel endpoint on a blocking task until SIGINT or SIGTERM.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{ArgGroup, CommandFactory, Parser};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use wcap::config::{self, Config};
use wcap::directory::NetlinkDirectory;
use wcap::network::{SysPoller, SystemSockets};
use wcap::relay::{RelayExit, Role};
use wcap::tunnel::{self, TunnelSettings};

#[derive(Parser, Debug)]
#[command(name = "wcap", version)]
#[command(about = "Tunnel raw 802.11 frames between two hosts over UDP", long_about = None)]
#[command(group(ArgGroup::new("role").required(true).args(["server", "client"])))]
struct Cli {
    /// Run as server; the peer is learned from incoming datagrams
    #[arg(short = 's', long)]
    server: bool,

    /// Run as client, sending to the server at PEER
    #[arg(short = 'c', long, value_name = "PEER")]
    client: Option<Ipv4Addr>,

    /// Optional TOML file with relay, monitor and metrics settings
    #[arg(long, env = "WCAP_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Wireless interface whose radio carries the monitor interface
    #[arg(value_name = "WIFACE")]
    wireless_interface: String,

    /// Interface carrying the UDP transport
    #[arg(value_name = "IFACE")]
    transport_interface: String,
}

impl Cli {
    const fn role(&self) -> Role {
        match self.client {
            Some(peer) => Role::Client { peer },
            None => Role::Server,
        }
    }
}

/// Wait for a shutdown signal or for the tunnel to stop on its own.
async fn wait_for_shutdown(
    running: Arc<AtomicBool>,
    mut tunnel_handle: JoinHandle<wcap::Result<RelayExit>>,
) -> Result<RelayExit> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down...");
            None
        }
        _ = terminate.recv() => {
            info!("SIGTERM received, shutting down...");
            None
        }
        result = &mut tunnel_handle => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            running.store(false, Ordering::SeqCst);
            tunnel_handle.await
        }
    };

    let exit = result.context("Tunnel task failed")??;
    info!("Shutdown complete.");
    Ok(exit)
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config::validate_interface_name("wireless", &cli.wireless_interface)?;
    config::validate_interface_name("transport", &cli.transport_interface)?;

    wcap::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    let settings = TunnelSettings::new(
        cli.role(),
        &cli.wireless_interface,
        &cli.transport_interface,
        &config,
    );
    info!(
        role = ?settings.role,
        wireless = %settings.wireless_interface,
        transport = %settings.transport_interface,
        port = settings.relay.port,
        "Starting wcap..."
    );

    let running = Arc::new(AtomicBool::new(true));
    let tunnel_running = Arc::clone(&running);
    let tunnel_handle = tokio::task::spawn_blocking(move || -> wcap::Result<RelayExit> {
        let directory = NetlinkDirectory::connect()?;
        tunnel::run(
            &directory,
            &SystemSockets,
            SysPoller,
            &settings,
            &tunnel_running,
        )
    });

    let RelayExit::Shutdown { stats } = wait_for_shutdown(running, tunnel_handle).await?;
    info!(
        uplink = stats.uplink_frames,
        downlink = stats.downlink_frames,
        dropped = stats.dropped,
        "Relayed frames"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let outcome = run(cli).await;
    if let Err(err) = &outcome {
        error!("{err:#}");
        if wants_usage(err) {
            eprintln!("{}", Cli::command().render_usage());
        }
    }
    exit_code(&outcome)
}

/// Configuration mistakes get the usage line on stderr.
fn wants_usage(err: &anyhow::Error) -> bool {
    err.downcast_ref::<wcap::Error>()
        .is_some_and(wcap::Error::is_configuration)
}

fn exit_code(outcome: &Result<()>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
