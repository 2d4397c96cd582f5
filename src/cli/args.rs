//! CLI arguments module
//!
//! Defines command-line argument parsing using clap. Flags overlay the
//! optional JSON configuration file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::config::EngineConfig;

/// CLI arguments for the torrent engine
#[derive(Debug, Parser)]
#[command(name = "rust-torrent-engine")]
#[command(about = "Download and seed torrents from known peers", long_about = None)]
pub struct CliArgs {
    /// Paths to .torrent files
    #[arg(value_name = "TORRENT", required = true)]
    pub torrents: Vec<PathBuf>,

    /// Download directory
    #[arg(short, long, value_name = "DIR", default_value = "./downloads")]
    pub output_dir: PathBuf,

    /// Listening port for incoming connections (0 = any free port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Peer to connect to, may be repeated
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<SocketAddr>,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Download pieces in order instead of rarest-first
    #[arg(long)]
    pub sequential: bool,

    /// Download limit in bytes per second (0 = unlimited)
    #[arg(long, value_name = "BYTES")]
    pub download_limit: Option<u64>,

    /// Upload limit in bytes per second (0 = unlimited)
    #[arg(long, value_name = "BYTES")]
    pub upload_limit: Option<u64>,

    /// Keep seeding after every torrent completes
    #[arg(long)]
    pub seed: bool,

    /// Progress refresh interval in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub interval: u64,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.interval.max(100))
    }

    /// Load the configuration file, if any, and apply the flags on top
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        self.apply_to(&mut config);
        Ok(config)
    }

    /// Overwrite the fields that were given on the command line
    pub fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if let Some(limit) = self.download_limit {
            config.download_limit = limit;
        }
        if let Some(limit) = self.upload_limit {
            config.upload_limit = limit;
        }
        if self.sequential {
            config.sequential = true;
        }
    }
}
