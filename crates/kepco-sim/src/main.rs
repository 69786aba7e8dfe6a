//! Standalone simulator.
//!
//! ```bash
//! kepco-sim                                   # 0.0.0.0:5024 (telnet) + 0.0.0.0:5025 (socket)
//! kepco-sim --telnet-port 6024 --socket-port 6025 --bind 127.0.0.1
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use kepco_sim::server::{DEFAULT_SOCKET_PORT, DEFAULT_TELNET_PORT};
use kepco_sim::{SimConfig, Simulator};
use std::net::{IpAddr, Ipv4Addr};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kepco-sim")]
#[command(about = "Kepco BIT 802E network simulator", long_about = None)]
struct Cli {
    /// Listen address
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Telnet port (0 disables)
    #[arg(long, default_value_t = DEFAULT_TELNET_PORT)]
    telnet_port: u16,

    /// Raw socket port (0 disables)
    #[arg(long, default_value_t = DEFAULT_SOCKET_PORT)]
    socket_port: u16,

    /// Skip the Telnet negotiation burst on connect
    #[arg(long)]
    no_negotiation: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let enabled = |port: u16| (port != 0).then_some(port);
    let config = SimConfig {
        bind: cli.bind,
        telnet_port: enabled(cli.telnet_port),
        socket_port: enabled(cli.socket_port),
        negotiate: !cli.no_negotiation,
        ..SimConfig::default()
    };

    let sim = Simulator::start(config)
        .await
        .context("binding simulator ports")?;
    tracing::info!(
        telnet = ?sim.telnet_addr(),
        socket = ?sim.socket_addr(),
        identity = kepco_sim::IDN,
        "Simulator running, Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    sim.stop().await;
    Ok(())
}
