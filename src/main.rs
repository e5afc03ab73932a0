use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use ondol::commands::{crawl, report, Engine};
use ondol::config::Config;

#[derive(Parser)]
#[command(
    name = "ondol",
    version,
    about = "Seoul stay-market occupancy crawler with time-series booking inference",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML); environment variables apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SweepArg {
    Search,
    Calendar,
    Detail,
}

#[derive(Subcommand)]
enum Commands {
    /// Load geographic targets from a JSON reference file
    InitTargets {
        /// Path to the targets file
        #[arg(short, long, default_value = "config/targets.json")]
        file: PathBuf,
    },

    /// Run one sweep of the given kind
    Crawl {
        /// Sweep kind
        kind: SweepArg,
    },

    /// Recompute date classifications from observation history
    Reconcile,

    /// Recompute daily occupancy/revenue statistics
    Aggregate {
        /// A single date (YYYY-MM-DD); overrides --days-back
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// How many preceding days to recompute
        #[arg(long, default_value = "1")]
        days_back: u32,
    },

    /// Print store counts and governor state
    Stats {
        /// Also dump Prometheus metrics
        #[arg(long, default_value = "false")]
        metrics: bool,
    },

    /// Run the crawl cadence loop (hourly search, nightly calendar)
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    setup_tracing(&cli.log_format, cli.verbose, &config)?;

    if let Err(e) = ondol::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed, continuing without");
    }

    tracing::info!(tier = %config.crawl.tier, "ondol starting");
    let engine = Engine::new(config)?;

    match cli.command {
        Commands::InitTargets { file } => {
            let added = crawl::load_targets(&engine, &file)?;
            println!("Loaded {added} new targets");
        }
        Commands::Crawl { kind } => match kind {
            SweepArg::Search => {
                crawl::run_search_sweep(&engine).await?;
            }
            SweepArg::Calendar => {
                crawl::run_calendar_sweep(&engine).await?;
            }
            SweepArg::Detail => {
                if crawl::run_detail_sweep(&engine).await?.is_none() {
                    println!("Detail refresh is disabled for this tier");
                }
            }
        },
        Commands::Reconcile => report::run_reconcile(&engine)?,
        Commands::Aggregate { date, days_back } => {
            report::run_aggregate(&engine, date, days_back)?
        }
        Commands::Stats { metrics } => report::run_stats(&engine, metrics)?,
        Commands::Run => crawl::run_daemon(&engine).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool, config: &Config) -> Result<()> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("ondol={level}")))
        .context("Invalid log filter")?;

    let format = if format == "text" {
        config.logging.format.as_str()
    } else {
        format
    };
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}
