mod alerts;
mod config;
mod detect;
mod error;
mod export;
mod models;
mod notify;
mod pipeline;
mod scheduler;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::alerts::AlertRegistry;
use crate::config::AppConfig;
use crate::models::{SeenSet, Snapshot};
use crate::pipeline::{Pipeline, RefreshOutcome};
use crate::scraper::PublicSportsSource;
use crate::storage::{DuckDbStore, KEY_SEEN, KEY_SNAPSHOT, StateStore};

#[derive(Parser)]
#[command(name = "court-watch", about = "Watches facility reservations for newly opened slots", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl once, detect new slots and notify subscribers
    Refresh,

    /// Refresh on a fixed period until interrupted
    Watch {
        /// Seconds between refreshes (default: pipeline.interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Print the last crawled snapshot (crawls only if none exists)
    Snapshot {
        /// Emit JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Write the last crawled snapshot as CSV
    Export {
        #[arg(short, long, default_value = "slots.csv")]
        out: PathBuf,
    },

    /// Manage alert conditions
    Alarm {
        #[command(subcommand)]
        action: AlarmCommand,
    },

    /// Drop expired alerts and seen-set entries
    Cleanup,

    /// Apply DuckDB schema migrations
    Migrate,
}

#[derive(Subcommand)]
enum AlarmCommand {
    /// Register an alert for a court group on a date (YYYY-MM-DD or YYYYMMDD)
    Add {
        #[arg(short, long)]
        subscriber: String,
        #[arg(short, long)]
        court: String,
        #[arg(short, long)]
        date: String,
    },
    Remove {
        #[arg(short, long)]
        subscriber: String,
        #[arg(short, long)]
        court: String,
        #[arg(short, long)]
        date: String,
    },
    List {
        #[arg(short, long)]
        subscriber: Option<String>,
    },
}

fn build_pipeline(config: &AppConfig, store: StateStore) -> Result<Pipeline<PublicSportsSource>> {
    let source = PublicSportsSource::new(&config.scraper, config.pipeline.concurrency)
        .context("Failed to build HTTP client")?;
    let notifier = notify::from_config(&config.notify).context("Failed to build notifier")?;
    Ok(Pipeline::new(
        Arc::new(source),
        store,
        notifier,
        &config.scraper,
        config.pipeline.clone(),
    ))
}

fn print_summary(snapshot: &Snapshot) {
    println!("─────────────────────────────────");
    println!("  Updated    : {}", snapshot.updated_at);
    println!("  Facilities : {}", snapshot.facilities.len());
    println!("  Open slots : {}", snapshot.slot_count());
    println!("─────────────────────────────────");
    for (id, facility) in &snapshot.facilities {
        let Some(dates) = snapshot.availability.get(id) else {
            continue;
        };
        println!("{} ({})", facility.title, facility.location);
        for (date, slots) in dates {
            let times: Vec<&str> = slots.iter().map(|s| s.time_label.as_str()).collect();
            println!("  {}  {}", utils::format_date_label(date), times.join(", "));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "court_watch=info,warn",
        1 => "court_watch=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load().context("Invalid configuration")?;
    let today = utils::today(config.pipeline.utc_offset_hours);

    match cli.command {
        Command::Refresh => {
            let store = storage::open_state(&config.storage)?;
            let pipeline = build_pipeline(&config, store)?;
            match pipeline.refresh().await.context("Refresh failed")? {
                RefreshOutcome::Completed(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                RefreshOutcome::Skipped => println!("Refresh already running, skipped."),
            }
        }

        Command::Watch { interval } => {
            let store = storage::open_state(&config.storage)?;
            let pipeline = build_pipeline(&config, store)?;
            let period = interval.map(Duration::from_secs).unwrap_or_else(|| pipeline.interval());
            scheduler::run_periodic(&pipeline, period).await;
        }

        Command::Snapshot { json } => {
            let store = storage::open_state(&config.storage)?;
            let pipeline = build_pipeline(&config, store)?;
            let snapshot = pipeline.current_snapshot().await.context("No snapshot")?;
            if json {
                println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            } else {
                print_summary(&snapshot);
            }
        }

        Command::Export { out } => {
            let store = storage::open_state(&config.storage)?;
            let pipeline = build_pipeline(&config, store)?;
            let snapshot = pipeline.current_snapshot().await.context("No snapshot")?;
            let _t = utils::Timer::start("CSV export");
            export::export_to_file(&snapshot, &out)?;
        }

        Command::Alarm { action } => {
            let store = storage::open_state(&config.storage)?;
            let registry = AlertRegistry::new(store.clone());
            match action {
                AlarmCommand::Add { subscriber, court, date } => {
                    let current: Option<Snapshot> = store.try_load(KEY_SNAPSHOT).unwrap_or_else(|e| {
                        warn!(error = %e, "stored snapshot unreadable");
                        None
                    });
                    let condition = registry
                        .register(&subscriber, &court, &date, today, current.as_ref())
                        .await?;
                    println!("Registered: {} / {} / {}", condition.subscriber_id, condition.court_group, condition.date);
                }
                AlarmCommand::Remove { subscriber, court, date } => {
                    registry.remove(&subscriber, &court, &date).await?;
                    println!("Removed.");
                }
                AlarmCommand::List { subscriber } => {
                    let conditions = registry.list(subscriber.as_deref());
                    if conditions.is_empty() {
                        println!("No alerts registered.");
                    }
                    for c in &conditions {
                        println!("  {}  {}  {}", c.subscriber_id, c.court_group, utils::format_date_label(&c.date));
                    }
                }
            }
        }

        Command::Cleanup => {
            let store = storage::open_state(&config.storage)?;
            let (expired, baseline_keys) =
                AlertRegistry::new(store.clone()).cleanup_expired(today).await?;

            let _state = store.exclusive().await;
            let mut seen: SeenSet = store.load_or_default(KEY_SEEN);
            let pruned = detect::prune_seen(&mut seen, today);
            store.save(KEY_SEEN, &seen)?;
            info!(
                "Done: {} alerts expired, {} baseline keys and {} seen keys pruned",
                expired, baseline_keys, pruned
            );
        }

        Command::Migrate => {
            DuckDbStore::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
