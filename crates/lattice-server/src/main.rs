//! Lattice demo server: a TCP listener and a reliable-UDP endpoint sharing
//! one config, one pipeline and one 20 Hz game tick.

mod messages;
mod service;
mod setup;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lattice_config::{CliArgs, Config};
use lattice_log::init_logging;
use lattice_net::{TcpListenerServer, UdpServer};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::service::EchoService;

/// Game tick: queued messages are dispatched at this rate.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir: PathBuf = match args.config.clone().map_or_else(Config::default_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_dir.display());
            std::process::exit(1);
        }
    };
    config.apply_cli_overrides(&args);

    init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );

    if let Err(e) = run(config).await {
        error!("server stopped: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let factory = setup::transcoder_factory(&config.pipeline)?;
    let service = Arc::new(EchoService);

    let tcp = TcpListenerServer::bind(
        setup::tcp_config(&config.tcp)?,
        factory.clone(),
        service.clone(),
    )?;
    let udp = UdpServer::bind(setup::udp_config(&config.udp)?, factory, service)?;
    info!(tcp = %tcp.local_addr(), udp = %udp.local_addr(), "lattice server up");

    let acceptor = tcp.clone();
    let accept_task = tokio::spawn(async move { acceptor.run().await });

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = tokio::time::interval(Duration::from_secs(1));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("ctrl-c handler failed: {e}");
                }
                break;
            }
            _ = tick.tick() => {
                tcp.update();
                udp.update();
            }
            _ = stats.tick(), if config.debug.log_stats => {
                info!(tcp = tcp.session_count(), udp = udp.session_count(), "sessions");
            }
        }
    }

    info!("shutting down");
    tcp.shutdown();
    udp.shutdown();
    if let Err(e) = accept_task.await {
        warn!("accept loop panicked: {e}");
    }
    Ok(())
}
