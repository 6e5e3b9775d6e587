//! Tripmap command-line tool.
//!
//! # Usage
//!
//! ```bash
//! # Ingest every trip under /data/logs into a fresh session database
//! tripmap ingest --logdir /data/logs --db /data/session.json.gz
//!
//! # Also dump Prometheus metrics for the run
//! tripmap ingest --logdir /data/logs --db session.json --metrics-out ingest.prom
//!
//! # Export one named point per second of the time map
//! tripmap export --db /data/session.json.gz --output points.json
//! ```
//!
//! # Graceful Shutdown
//!
//! Ctrl+C abandons a running ingest. Producer threads stop, and the session
//! database on disk is left as it was.

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tripmap_core::metrics::init_metrics;
use tripmap_ingest::{Ingest, IngestConfig, IngestStats, SessionDb, TripLayout};

/// Tripmap: where was each wireless device first heard.
#[derive(Parser, Debug)]
#[command(name = "tripmap")]
#[command(about = "Correlate GPS logs with wireless captures")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every trip under a log directory into a session database
    Ingest(IngestArgs),
    /// Export a session database as named points
    Export(ExportArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Directory holding one subdirectory per trip
    #[arg(long)]
    logdir: PathBuf,

    /// Session database file (.gz for compressed)
    #[arg(long)]
    db: PathBuf,

    /// Write Prometheus metrics to this file when done
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// GPS log path inside each trip
    #[arg(long, default_value = "gps/nmea.log")]
    gps_log: PathBuf,

    /// Capture directory inside each trip
    #[arg(long, default_value = "wifi")]
    capture_dir: PathBuf,

    /// Interface directory name prefix
    #[arg(long, default_value = "wl")]
    interface_prefix: String,

    /// Capture file name prefix
    #[arg(long, default_value = "pcap")]
    capture_prefix: String,

    /// Maximum packet age relative to its fix, in milliseconds
    #[arg(long, default_value = "5000")]
    staleness_ms: i64,
}

impl IngestArgs {
    fn config(&self) -> IngestConfig {
        IngestConfig {
            layout: TripLayout {
                gps_log: self.gps_log.clone(),
                capture_dir: self.capture_dir.clone(),
                interface_prefix: self.interface_prefix.clone(),
                capture_prefix: self.capture_prefix.clone(),
            },
            staleness: TimeDelta::milliseconds(self.staleness_ms),
            ..IngestConfig::default()
        }
    }
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Session database file
    #[arg(long)]
    db: PathBuf,

    /// Output file (default: stdout)
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("tripmap_ingest=debug".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Ingest(args) => ingest(&args),
        Command::Export(args) => export(&args),
    }
}

fn ingest(args: &IngestArgs) -> Result<()> {
    let metrics_handle = match args.metrics_out {
        Some(_) => init_metrics(),
        None => None,
    };

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, abandoning ingest...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let mut db = SessionDb::load_or_default(&args.db)
        .with_context(|| format!("Failed to load {}", args.db.display()))?;

    let ingest = Ingest::new(args.config()).with_shutdown_flag(running);
    let start = Instant::now();
    let stats = db
        .add_trips_with(&args.logdir, &ingest)
        .with_context(|| format!("Failed to ingest {}", args.logdir.display()))?;
    let elapsed = start.elapsed();

    db.save(&args.db)
        .with_context(|| format!("Failed to save {}", args.db.display()))?;

    if let (Some(path), Some(handle)) = (&args.metrics_out, &metrics_handle) {
        fs::write(path, handle.render())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    print_summary(args, &db, &stats, elapsed);
    Ok(())
}

fn export(args: &ExportArgs) -> Result<()> {
    let db = SessionDb::load(&args.db)
        .with_context(|| format!("Failed to load {}", args.db.display()))?;
    let points = db.time_map().points();
    let json = serde_json::to_string_pretty(&points)?;

    match &args.output {
        Some(path) => {
            fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Exported {} points to {}", points.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)?;
        }
    }
    Ok(())
}

fn print_summary(args: &IngestArgs, db: &SessionDb, stats: &IngestStats, elapsed: Duration) {
    let correlator = &stats.correlator;

    println!("\n══════════════════════════════════════════════════════════════════");
    println!("SUMMARY");
    println!("══════════════════════════════════════════════════════════════════\n");

    println!("Log dir:     {}", args.logdir.display());
    println!("Database:    {}", args.db.display());
    println!("Elapsed:     {:.2?}", elapsed);
    println!();
    println!("Trips:             {:>12}", stats.trips);
    println!("Trips recorded:    {:>12}", db.trips().count());
    println!("Interfaces:        {:>12}", stats.interfaces.len());
    println!();
    println!("Fixes:             {:>12}", correlator.fixes_total);
    println!("  - Unusable:        {:>10}", correlator.fixes_unusable);
    println!("Packets:           {:>12}", correlator.packets_total);
    println!("  - Stale:           {:>10}", correlator.packets_stale);
    println!("  - Unplaced:        {:>10}", correlator.packets_unplaced);
    println!("  - Never due:       {:>10}", correlator.pending_discarded);
    println!("Joined records:    {:>12}", correlator.records_joined);
    println!("  - Duplicates:      {:>10}", stats.builder.duplicates);
    println!("Inserted records:  {:>12}", stats.builder.inserted);
    println!("Time map buckets:  {:>12}", db.time_map().len());

    if !stats.failures().is_empty() {
        println!();
        println!("Streams ended early:");
        for failure in stats.failures() {
            println!(
                "  - {} in {} ({}): {}",
                failure.stream,
                failure.trip,
                failure.path.display(),
                failure.error
            );
        }
    }
    println!();
}
