//! EGTS receiver CLI.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;

use egts_receiver::cli::*;
use egts_receiver::config::{init_logging, Config};
use egts_receiver::generator::{send_packet, PacketSpec};
use egts_receiver::geometry::GeometrySimplifier;
use egts_receiver::receiver::{Receiver, Stores};
use egts_receiver::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config if specified
    let mut config = if let Some(ref path) = cli.config {
        Config::load(path).with_context(|| format!("loading {}", path.display()))?
    } else if Config::default_path().exists() {
        Config::load(Config::default_path())?
    } else {
        Config::default()
    };

    if let Some(level) = cli.log_level.clone() {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.as_str().into();
    }
    if cli.no_color {
        config.logging.color = false;
        colored::control::set_override(false);
    }
    let _guard = init_logging(&config.logging)?;

    match cli.command {
        Commands::Serve(args) => run_serve(args, config).await,
        Commands::Send(args) => run_send(args).await,
        Commands::Simplify(args) => run_simplify(args, config).await,
        Commands::Config(args) => run_config(&args),
    }
}

/// Run the receiver until interrupted
async fn run_serve(args: ServeArgs, mut config: Config) -> Result<()> {
    if !args.listen.is_empty() {
        config.server.listen_addrs = args.listen;
    }
    if let Some(ttl) = args.connection_ttl {
        config.server.connection_ttl = ttl;
    }
    if args.seed.is_some() {
        config.storage.seed_file = args.seed;
    }
    if args.readings.is_some() {
        config.storage.readings_file = args.readings;
    }
    config.validate()?;

    println!("{} {}", "EGTS receiver".bright_cyan().bold(), VERSION);

    let (_store, stores) = Stores::open(&config).await?;
    let receiver = Receiver::new(config, stores);
    receiver.signals().install();

    let running = receiver.start().await?;
    for addr in running.local_addrs() {
        println!("  {} {}", "→".cyan(), addr);
    }

    let stats = running.wait().await?;
    println!(
        "{} saved {}, skipped {}, failed {}",
        "Stopped:".bright_white(),
        stats.saved,
        stats.skipped,
        stats.failed
    );
    Ok(())
}

/// Send one generated packet and check the acknowledgement
async fn run_send(args: SendArgs) -> Result<()> {
    let addr = resolve_addr(&args.server).await?;
    let spec = PacketSpec {
        kind: args.kind.into(),
        packet_id: args.pid,
        object_id: args.oid,
        time: args.time.unwrap_or_else(Utc::now),
        latitude: args.lat,
        longitude: args.lon,
        liquid_level: args.liquid,
    };

    println!(
        "Sending {} packet {} (oid {}) to {}",
        spec.kind, spec.packet_id, spec.object_id, addr
    );
    let response = send_packet(addr, spec.build(), Duration::from_secs(args.timeout))
        .await
        .context("no acknowledgement")?;

    let result = response.result();
    if !result.is_ok() {
        bail!("packet {} rejected: {result:?}", spec.packet_id);
    }
    println!("{} packet {} acknowledged", "✓".green(), spec.packet_id);
    for record in response.records.iter().flat_map(|r| r.subrecords.iter()) {
        println!("  {record:?}");
    }
    Ok(())
}

async fn resolve_addr(server: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("resolving {server}"))?
        .next()
        .with_context(|| format!("{server} did not resolve to any address"))
}

/// Simplify the tracks in the seed file and write the result back
async fn run_simplify(args: SimplifyArgs, config: Config) -> Result<()> {
    let Some(seed_path) = config.storage.seed_file.clone() else {
        bail!("storage.seed_file is not configured");
    };
    let (store, stores) = Stores::open(&config).await?;

    let simplifier = GeometrySimplifier::new(
        Arc::clone(&stores.tracks),
        args.tolerance.unwrap_or(config.schedule.tolerance),
        args.lookback.unwrap_or(config.schedule.lookback),
    );
    let report = simplifier.run().await?;
    store
        .snapshot()
        .save(&seed_path)
        .with_context(|| format!("writing {}", seed_path.display()))?;

    println!(
        "{} {} tracks, {} points, {} deleted",
        "✓".green(),
        report.tracks,
        report.points,
        report.deleted
    );
    if report.failed > 0 {
        println!("{} {} deletions failed", "⚠".yellow(), report.failed);
    }
    Ok(())
}

/// Show example configuration
fn run_config(args: &ConfigArgs) -> Result<()> {
    let output = toml::to_string_pretty(&Config::example())?;

    if let Some(ref path) = args.output {
        std::fs::write(path, &output)?;
        println!(
            "{} Configuration written to {}",
            "✓".green(),
            path.display()
        );
    } else {
        println!("{output}");
    }

    Ok(())
}
