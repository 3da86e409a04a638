//! Command line interface for the EGTS receiver.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::generator::PacketKind;

/// EGTS receiver - telematics data collection over TCP
#[derive(Parser, Debug)]
#[command(
    name = "egts-receiver",
    author,
    version,
    about = "Receives EGTS navigation data from vehicle terminals",
    long_about = r#"
Accepts EGTS transport connections from whitelisted provider addresses,
acknowledges every packet and stores the navigation readings against the
vehicle the terminal belongs to.

QUICK START:
  Example config:  egts-receiver config --output receiver.toml
  Receiver:        egts-receiver -c receiver.toml serve
  Test packet:     egts-receiver send 127.0.0.1:6000 --oid 12 --type mixed
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the receiver
    Serve(ServeArgs),

    /// Send a generated packet to a receiver and check the acknowledgement
    Send(SendArgs),

    /// Run one track simplification pass and exit
    Simplify(SimplifyArgs),

    /// Show example configuration
    Config(ConfigArgs),
}

/// Serve command arguments
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen addresses, replacing the configured ones (repeatable)
    #[arg(short = 'L', long)]
    pub listen: Vec<SocketAddr>,

    /// Read deadline per packet part, e.g. "30s"
    #[arg(long, value_parser = humantime_duration)]
    pub connection_ttl: Option<Duration>,

    /// Vehicle and provider seed file
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Append saved readings to this JSON-lines file
    #[arg(long)]
    pub readings: Option<PathBuf>,
}

/// Send command arguments
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Receiver address
    #[arg(default_value = "localhost:5555")]
    pub server: String,

    /// Packet identifier
    #[arg(long, default_value = "1")]
    pub pid: u16,

    /// Object identifier of the sending terminal
    #[arg(long, default_value = "1")]
    pub oid: u32,

    /// Navigation time (RFC 3339), defaults to now
    #[arg(long)]
    pub time: Option<DateTime<Utc>>,

    /// Latitude in degrees
    #[arg(long, default_value = "55.75", allow_hyphen_values = true)]
    pub lat: f64,

    /// Longitude in degrees
    #[arg(long, default_value = "37.62", allow_hyphen_values = true)]
    pub lon: f64,

    /// Liquid level for mixed packets
    #[arg(long, default_value = "0")]
    pub liquid: u32,

    /// Packet contents
    #[arg(short = 't', long = "type", default_value = "tele")]
    pub kind: KindArg,

    /// Seconds to wait for the acknowledgement
    #[arg(long, default_value = "5")]
    pub timeout: u64,
}

/// Simplify command arguments
#[derive(Args, Debug)]
pub struct SimplifyArgs {
    /// Distance tolerance in metres, overriding the configured one
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// How far back to look for tracks, e.g. "2h"
    #[arg(long, value_parser = humantime_duration)]
    pub lookback: Option<Duration>,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Log format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Generated packet kind
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindArg {
    /// Authentication record
    Auth,
    /// Position only
    Tele,
    /// Position and liquid level
    Mixed,
}

impl From<KindArg> for PacketKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Auth => Self::Auth,
            KindArg::Tele => Self::Telemetry,
            KindArg::Mixed => Self::Mixed,
        }
    }
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}
