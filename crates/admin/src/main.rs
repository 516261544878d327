//! shelf-admin: operator commands for the product catalog sync engine.
//!
//! Configuration comes from the environment (see `SyncConfig::from_env`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::warn;

use shelf_core::AggregateId;
use shelf_infra::{Backend, LogFormat, SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(
    name = "shelf-admin",
    version,
    about = "Operator tooling for the product catalog sync engine",
    propagate_version = true
)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum Source {
    /// The projected read model
    #[default]
    Read,
    /// The authoritative store
    Write,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the read model from the authoritative store
    Resync,

    /// Rebuild the read model by replaying the whole event log
    Replay,

    /// Project events that are newer than their checkpoint
    CatchUp,

    /// List stored events in replay order
    Events {
        /// Only events of this aggregate, in version order
        #[arg(short, long)]
        aggregate: Option<AggregateId>,
    },

    /// List products
    Products {
        #[arg(short, long, value_enum, default_value_t = Source::Read)]
        source: Source,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("failed to load configuration")?;

    shelf_observability::init(match config.log_format {
        LogFormat::Json => shelf_observability::Format::Json,
        LogFormat::Pretty => shelf_observability::Format::Pretty,
    });

    if config.backend == Backend::InMemory {
        warn!("in-memory backend selected; the stores start empty");
    }

    let engine = SyncEngine::from_config(&config)
        .await
        .context("failed to start sync engine")?;

    match cli.command {
        Commands::Resync => {
            let report = engine.resync().await.context("resync failed")?;
            emit(cli.format, &report, || format!("resynced {} products", report.count))
        }
        Commands::Replay => {
            let report = engine.replay().await.context("replay failed")?;
            emit(cli.format, &report, || {
                format!(
                    "replayed {} events ({} of unknown type skipped)",
                    report.count, report.skipped
                )
            })
        }
        Commands::CatchUp => {
            let report = engine.catch_up().await.context("catch-up failed")?;
            emit(cli.format, &report, || {
                format!(
                    "applied {} events, {} skipped, {} failed",
                    report.applied, report.skipped, report.failed
                )
            })
        }
        Commands::Events { aggregate } => {
            let events = match aggregate {
                Some(id) => engine.list_events_for(id).await,
                None => engine.list_all_events().await,
            }
            .context("failed to list events")?;

            emit(cli.format, &events, || {
                events
                    .iter()
                    .map(|e| {
                        format!(
                            "{}  {}  v{}  {}  {}",
                            e.created_at.to_rfc3339(),
                            e.aggregate_id,
                            e.version,
                            e.event_type,
                            e.payload
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Products { source: Source::Read } => {
            let views = engine.find_all().await.context("failed to list read model")?;
            emit(cli.format, &views, || {
                views
                    .iter()
                    .map(|v| {
                        format!(
                            "{}  v{}  {}  price={} stock={}",
                            v.product_id, v.version, v.details.name, v.details.price, v.details.stock_quantity
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Products { source: Source::Write } => {
            let products = engine
                .list_products()
                .await
                .context("failed to list authoritative records")?;
            emit(cli.format, &products, || {
                products
                    .iter()
                    .map(|p| {
                        format!(
                            "{}  v{}  {}  price={} stock={}",
                            p.id, p.version, p.details.name, p.details.price, p.details.stock_quantity
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, text: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{}", text()),
    }
    Ok(())
}
