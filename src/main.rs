//! Heimdall-ASIS: market-intelligence ingestion and cleaning pipeline.
//!
//! Subcommands:
//!   ingest    poll upstream sources at one frequency and land raw rows
//!   clean     transform newly ingested raw rows into silver tables
//!   schedule  long-running loop firing ingest-then-clean on declared ticks
//!   activate  probe catalog entries and activate the ones that respond
//!
//! Exit codes: 0 on batch completion (including per-record errors); non-zero
//! only on fatal setup failure (store unavailable, missing credentials).

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::json;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use heimdall_asis::adapters::AdapterConfig;
use heimdall_asis::cleaners::BodyExtractor;
use heimdall_asis::ingest::IngestEngine;
use heimdall_asis::models::{CatalogEntry, SourceFamily, UpdateFrequency};
use heimdall_asis::pipeline::{CleanOptions, CleaningPipeline, DEFAULT_BATCH_CAP};
use heimdall_asis::scheduler::Scheduler;
use heimdall_asis::{FetchClient, FetchClientConfig, Store};

#[derive(Parser)]
#[command(name = "heimdall", about = "Market-intelligence ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll upstream sources at one frequency and land raw rows
    Ingest {
        /// HOURLY, DAILY, MONTHLY or QUARTERLY
        #[arg(long, value_parser = parse_frequency)]
        frequency: UpdateFrequency,
        /// Restrict the batch to a single catalog key
        #[arg(long)]
        catalog: Option<String>,
    },
    /// Transform newly ingested raw rows into silver tables
    Clean {
        /// MACRO, MICRO, NEWS or ALL
        #[arg(long, default_value = "ALL")]
        source: String,
        /// Log intended effects without committing anything
        #[arg(long)]
        dry_run: bool,
        /// Raw rows per delta batch
        #[arg(long)]
        limit: Option<usize>,
        /// Reset the cleaning watermark for a family (or ALL) and exit
        #[arg(long, value_name = "FAMILY")]
        reset_watermark: Option<String>,
        /// Print watermark positions and exit
        #[arg(long)]
        show_watermarks: bool,
        /// Print a raw-vs-silver consistency report and exit
        #[arg(long)]
        verify: bool,
    },
    /// Run the long-lived scheduler until SIGINT/SIGTERM
    Schedule,
    /// Probe catalog entries and activate the ones that respond
    Activate {
        /// Probe a single catalog key (re-probes even if already active)
        #[arg(long)]
        catalog: Option<String>,
    },
}

fn parse_frequency(s: &str) -> Result<UpdateFrequency, String> {
    UpdateFrequency::parse(s)
        .ok_or_else(|| format!("unknown frequency '{s}' (expected HOURLY|DAILY|MONTHLY|QUARTERLY)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let cli = Cli::parse();

    let db_path =
        std::env::var("HEIMDALL_DB_PATH").unwrap_or_else(|_| "data/heimdall.db".to_string());
    let store = Store::open(Path::new(&db_path)).context("failed to open store")?;

    let seeded = store
        .seed_catalog(&default_catalog())
        .await
        .context("failed to seed catalog")?;
    if seeded > 0 {
        info!(seeded, "seeded default catalog entries");
    }
    info!(db_path = %db_path, "store ready");

    let cancel = shutdown_token();

    match cli.command {
        Command::Ingest { frequency, catalog } => {
            let engine = build_engine(&store)?;
            let report = engine
                .ingest(frequency, catalog.as_deref(), &cancel)
                .await
                .context("ingestion batch could not start")?;
            println!(
                "ingest {}: attempted={} succeeded={} empty={} failed={} raw_rows_written={}",
                frequency.as_str(),
                report.attempted,
                report.succeeded,
                report.skipped_empty,
                report.failed,
                report.raw_rows_written,
            );
        }

        Command::Clean {
            source,
            dry_run,
            limit,
            reset_watermark,
            show_watermarks,
            verify,
        } => {
            let pipeline = build_pipeline(&store);

            if show_watermarks {
                print_watermarks(&store).await?;
                return Ok(());
            }
            if verify {
                print_verify(&pipeline).await?;
                return Ok(());
            }
            if let Some(target) = reset_watermark {
                let family = parse_family_selector(&target)?;
                pipeline
                    .reset_watermark(family)
                    .await
                    .context("watermark reset failed")?;
                return Ok(());
            }

            let families = match parse_family_selector(&source)? {
                Some(f) => vec![f],
                None => SourceFamily::ALL.to_vec(),
            };
            let options = CleanOptions {
                families,
                dry_run,
                batch_cap: limit.unwrap_or(DEFAULT_BATCH_CAP).max(1),
            };
            let report = pipeline
                .clean(&options, &cancel)
                .await
                .context("cleaning could not start")?;
            println!(
                "clean: batches={} raw_rows_seen={} silver_rows_written={} skipped={}{}",
                report.batches,
                report.raw_rows_seen,
                report.silver_rows_written,
                report.skipped,
                if dry_run { " (dry run)" } else { "" },
            );
        }

        Command::Schedule => {
            let engine = build_engine(&store)?;
            let pipeline = build_pipeline(&store);
            Scheduler::new(engine, pipeline)
                .run(&cancel)
                .await
                .context("scheduler failed")?;
        }

        Command::Activate { catalog } => {
            let engine = build_engine(&store)?;
            let activated = engine
                .activate(catalog.as_deref(), &cancel)
                .await
                .context("activation pass could not start")?;
            println!("activate: {activated} catalog entries activated");
        }
    }

    Ok(())
}

fn build_engine(store: &Store) -> Result<IngestEngine> {
    let adapters = AdapterConfig::from_env().context("missing upstream credentials")?;
    let http = FetchClient::new(FetchClientConfig::default());
    Ok(IngestEngine::new(store.clone(), http, adapters))
}

fn build_pipeline(store: &Store) -> CleaningPipeline {
    // article fetches carry no credentials; a dedicated client keeps their
    // pacing state separate from the vendor APIs
    let extractor = BodyExtractor::new(FetchClient::new(FetchClientConfig::default()));
    CleaningPipeline::new(store.clone(), extractor)
}

/// `MACRO`/`MICRO`/`NEWS` select one family; `ALL` selects none (= every).
fn parse_family_selector(s: &str) -> Result<Option<SourceFamily>> {
    if s.trim().eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    match SourceFamily::parse(s) {
        Some(f) => Ok(Some(f)),
        None => bail!("unknown source '{s}' (expected MACRO|MICRO|NEWS|ALL)"),
    }
}

async fn print_watermarks(store: &Store) -> Result<()> {
    let watermarks = store.list_watermarks().await?;
    if watermarks.is_empty() {
        println!("no watermarks yet");
        return Ok(());
    }
    println!("{:<40} {:<28} {:<28}", "catalog_key", "last_ingested_at", "last_cleaned_at");
    for (key, wm) in watermarks {
        println!(
            "{:<40} {:<28} {:<28}",
            key,
            wm.last_ingested_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
            wm.last_cleaned_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

async fn print_verify(pipeline: &CleaningPipeline) -> Result<()> {
    println!(
        "{:<14} {:>9} {:>12} {:>12}  watermark",
        "family", "raw_rows", "silver_rows", "pending_raw"
    );
    for row in pipeline.verify().await? {
        println!(
            "{:<14} {:>9} {:>12} {:>12}  {}",
            row.family.as_str(),
            row.raw_rows,
            row.silver_rows,
            row.pending_raw_rows,
            row.watermark
                .last_cleaned_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

/// Cancellation token wired to SIGINT/SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        signalled.cancel();
    });
    token
}

/// Default catalog seeded on first boot. Entries start inactive; `activate`
/// probes them and flips the ones whose upstream responds.
fn default_catalog() -> Vec<CatalogEntry> {
    let entry = |key: &str,
                 family: SourceFamily,
                 frequency: UpdateFrequency,
                 config: serde_json::Value,
                 role: &str,
                 scope: &str| CatalogEntry {
        catalog_key: key.to_string(),
        source_family: family,
        update_frequency: frequency,
        source_config: config,
        is_active: false,
        role_tag: Some(role.to_string()),
        scope_tag: Some(scope.to_string()),
        created_at: Utc::now(),
    };

    vec![
        entry(
            "METRIC_US_10Y_YIELD",
            SourceFamily::MacroSeries,
            UpdateFrequency::Daily,
            json!({"series_id": "DGS10"}),
            "judgment",
            "macro",
        ),
        entry(
            "METRIC_US_CPI",
            SourceFamily::MacroSeries,
            UpdateFrequency::Monthly,
            json!({"series_id": "CPIAUCSL"}),
            "judgment",
            "macro",
        ),
        entry(
            "METRIC_US_UNEMPLOYMENT",
            SourceFamily::MacroSeries,
            UpdateFrequency::Monthly,
            json!({"series_id": "UNRATE"}),
            "validation",
            "macro",
        ),
        entry(
            "METRIC_US_GDP",
            SourceFamily::MacroSeries,
            UpdateFrequency::Quarterly,
            json!({"series_id": "GDPC1"}),
            "judgment",
            "macro",
        ),
        entry(
            "NVDA",
            SourceFamily::PriceBars,
            UpdateFrequency::Daily,
            json!({"symbol": "NVDA"}),
            "judgment",
            "micro",
        ),
        entry(
            "SPY",
            SourceFamily::PriceBars,
            UpdateFrequency::Daily,
            json!({"symbol": "SPY"}),
            "validation",
            "micro",
        ),
        entry(
            "NEWS_US_TECH_SECTOR",
            SourceFamily::NewsFeed,
            UpdateFrequency::Hourly,
            json!({"query": "semiconductors OR \"artificial intelligence\"",
                   "domains": "reuters.com,cnbc.com"}),
            "validation",
            "micro",
        ),
        entry(
            "NEWS_GLOBAL_MACRO",
            SourceFamily::NewsFeed,
            UpdateFrequency::Daily,
            json!({"query": "\"federal reserve\" OR inflation OR tariffs"}),
            "validation",
            "macro",
        ),
    ]
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
