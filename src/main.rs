//! strata CLI
//!
//! Command-line interface for the strata storage layer:
//! - Run startup recovery over a data directory
//! - Inspect a single data file and its companion index
//! - Generate a default config file

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strata::config::{generate_default_config, Config, LoggingConfig};
use strata::index::TimeRangeIndex;
use strata::recovery::{scan_file, ScanVerdict};
use strata::storage::{
    ranges_path, read_tombstone_file, recover_data_dir, tombstone_path, EngineConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "strata")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Crash-safe columnar storage for device time series")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (default: standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Recover every data file under the data directory
    Recover {
        /// Data directory (default: from config)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Inspect a data file: structure, time ranges, companion status
    Inspect {
        /// Path to a .tsd data file
        file: PathBuf,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Recover { data_dir, format } => {
            let mut engine_config = EngineConfig::new(&config.storage.data_dir);
            engine_config.recovery_parallelism = config.recovery.parallelism;
            if let Some(dir) = data_dir {
                engine_config.data_dir = dir;
            }

            if !engine_config.data_dir.exists() {
                eprintln!("Data directory not found: {:?}", engine_config.data_dir);
                std::process::exit(1);
            }

            let (resources, report) = recover_data_dir(&engine_config).await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{:<48} {:<10} {:>8}", "File", "Status", "Devices");
                println!("{}", "-".repeat(70));
                for (outcome, resource) in report.outcomes.iter().zip(&resources) {
                    let status = if outcome.has_crashed {
                        "crashed"
                    } else if outcome.repaired {
                        "repaired"
                    } else {
                        "clean"
                    };
                    println!(
                        "{:<48} {:<10} {:>8}",
                        outcome.path.display(),
                        status,
                        resource.ranges().device_count()
                    );
                }
                for failure in &report.failures {
                    println!("{:<48} FAILED: {}", failure.path.display(), failure.error);
                }
                println!();
                println!("{}", report);
            }

            if !report.failures.is_empty() {
                std::process::exit(1);
            }
        }

        Commands::Inspect { file } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }
            inspect_file(&file)?;
        }

        Commands::Config { output } => {
            let content = generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &content)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", content);
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("strata={}", logging.level)),
    );
    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn inspect_file(file: &std::path::Path) -> anyhow::Result<()> {
    let file_len = std::fs::metadata(file)?.len();
    println!("File: {}", file.display());
    println!("Size: {} bytes", file_len);

    let verdict = scan_file(file)?;
    match &verdict {
        ScanVerdict::Intact { groups } => {
            println!("Footer: valid ({} chunk groups)", groups.len());
        }
        ScanVerdict::Truncated { valid_len, groups } => {
            println!("Footer: missing or invalid");
            println!(
                "Valid region: {} of {} bytes ({} complete chunk groups)",
                valid_len,
                file_len,
                groups.len()
            );
        }
    }

    let groups = verdict.groups();
    if !groups.is_empty() {
        println!();
        println!(
            "{:<24} {:>10} {:>10} {:<20} {:<20}",
            "Device", "Offset", "Length", "From", "To"
        );
        println!("{}", "-".repeat(88));
        for group in groups {
            println!(
                "{:<24} {:>10} {:>10} {:<20} {:<20}",
                group.device,
                group.offset,
                group.length,
                format_timestamp(group.min_timestamp),
                format_timestamp(group.max_timestamp)
            );
        }
    }

    println!();
    match TimeRangeIndex::load(ranges_path(file)) {
        Ok(index) => {
            println!("Companion index ({} devices):", index.device_count());
            for (device, range) in index.iter() {
                println!(
                    "  {:<22} {} .. {}",
                    device,
                    format_timestamp(range.start),
                    format_timestamp(range.end)
                );
            }
            if index.covers(groups) {
                println!("Companion is consistent with the data file");
            } else {
                println!("Companion is NARROWER than the data file (recovery will rebuild it)");
            }
        }
        Err(e) => {
            println!("Companion index: missing or unreadable ({})", e);
        }
    }

    let tombstones = read_tombstone_file(tombstone_path(file))?;
    if !tombstones.is_empty() {
        println!("Tombstones: {}", tombstones.len());
    }

    Ok(())
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
