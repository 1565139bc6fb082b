//! Command-line argument parsing for the lattice server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Lattice server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "lattice-server", about = "Lattice TCP + reliable-UDP echo server")]
pub struct CliArgs {
    /// Interface both listeners bind to.
    #[arg(long)]
    pub bind: Option<String>,

    /// TCP listening port.
    #[arg(long)]
    pub tcp_port: Option<u16>,

    /// Reliable-UDP listening port.
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// Maximum concurrent TCP sessions.
    #[arg(long)]
    pub max_sessions: Option<u32>,

    /// Reliable-UDP session tick in milliseconds.
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.tcp.bind_address = bind.clone();
            self.udp.bind_address = bind.clone();
        }
        if let Some(port) = args.tcp_port {
            self.tcp.port = port;
        }
        if let Some(port) = args.udp_port {
            self.udp.port = port;
        }
        if let Some(max) = args.max_sessions {
            self.tcp.max_sessions = max;
        }
        if let Some(tick) = args.tick_ms {
            self.udp.tick_ms = tick;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
