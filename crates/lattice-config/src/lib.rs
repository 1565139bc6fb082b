//! Configuration for the lattice server.
//!
//! Settings persist to disk as RON files with CLI overrides via clap,
//! hot-reload detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, PipelineSection, TcpSection, UdpSection};
pub use error::ConfigError;
