mod scoring;

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gavel_client::{HtmlListingParser, HttpDiscoverySource, HttpPageFetcher, discovery_source, listing_parser};
use gavel_core::analysis::MemoryOpportunityStore;
use gavel_core::cache::MemorySnapshotStore;
use gavel_core::fetch::FetchWorker;
use gavel_core::job_queue::MemoryJobQueue;
use gavel_core::orchestrator::TracingReporter;
use gavel_core::rate_governor::RateGovernor;
use gavel_core::rotator::IdentityRotator;
use gavel_core::scheduler::DiscoveryCursor;
use gavel_core::{
    DiscoveryTarget, JobQueue, JobState, ListingRef, OpportunityRecord, OpportunityStore, Pipeline,
    PipelineConfig, PipelineParts, PipelineStatus, SnapshotStore, Source,
};
use gavel_db::{Database, DatabaseConfig};

use crate::scoring::{Predictor, Shipping};

/// Opportunities printed when `run` stops.
const RUN_SUMMARY_LIMIT: usize = 50;

type HttpPipeline<Q, S, O> = Pipeline<
    Q,
    S,
    HttpPageFetcher,
    HtmlListingParser,
    HttpDiscoverySource,
    Predictor,
    Shipping,
    O,
>;

#[derive(Parser)]
#[command(name = "gavel", version, about = "Auction discovery and resale margin analysis")]
struct Cli {
    /// Pipeline configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true, env = "GAVEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run discovery, fetching and analysis until Ctrl-C
    Run {
        /// Keep all state in memory instead of PostgreSQL
        #[arg(long, default_value_t = false)]
        memory: bool,

        /// Discovery target as `source:query` (repeatable)
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },

    /// Walk one search and print the listings it finds
    Discover {
        /// Listing source (ebay, local, other)
        #[arg(short, long)]
        source: String,

        /// Search keywords
        #[arg(short, long)]
        query: String,

        /// Result pages to read (defaults to [discovery].max_pages)
        #[arg(short, long)]
        pages: Option<u32>,
    },

    /// Fetch and parse a single listing, printing the snapshot as JSON
    Fetch {
        /// Listing source (ebay, local, other)
        #[arg(short, long)]
        source: String,

        /// Listing id at the source
        #[arg(short, long)]
        id: String,

        /// Listing page URL
        #[arg(short, long)]
        url: String,
    },

    /// Show job counts, dead letters and suppressed opportunities
    Status,

    /// List emitted opportunities
    Opportunities {
        /// Only records computed after this instant (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Number of results to show
        #[arg(short, long, default_value_t = 100)]
        limit: usize,

        /// Write the records to a CSV file instead of stdout
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gavel=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run { memory, targets } => cmd_run(&config, memory, &targets).await?,
        Commands::Discover {
            source,
            query,
            pages,
        } => cmd_discover(&config, &source, &query, pages).await?,
        Commands::Fetch { source, id, url } => cmd_fetch(&config, &source, &id, &url).await?,
        Commands::Status => {
            let db = connect_db().await?;
            let pipeline = build_pipeline(
                &config,
                db.job_repo(),
                db.snapshot_repo(),
                db.opportunity_repo(),
            )?;
            let status = pipeline.status().await?;
            print_status(&status);
        }
        Commands::Opportunities { since, limit, csv } => {
            let db = connect_db().await?;
            let pipeline = build_pipeline(
                &config,
                db.job_repo(),
                db.snapshot_repo(),
                db.opportunity_repo(),
            )?;
            let since = since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            let records = pipeline.get_opportunities(since, limit).await?;
            match csv {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    write_csv(&records, file)?;
                    tracing::info!(count = records.len(), path = %path.display(), "Opportunities exported");
                }
                None => print_opportunities(&records),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::from_env().context("Invalid configuration")?,
    };
    Ok(config)
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()
        .context("DATABASE_URL not set. Required unless `run --memory` is used.")?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    Ok(db)
}

fn parse_source(name: &str) -> Result<Source> {
    Source::from_str(name).map_err(anyhow::Error::msg)
}

/// Parse `source:query` into a target using the configured depth and cadence.
fn parse_target(spec: &str, config: &PipelineConfig) -> Result<DiscoveryTarget> {
    let Some((source, query)) = spec.split_once(':') else {
        bail!("invalid target '{spec}', expected source:query");
    };
    let query = query.trim();
    if query.is_empty() {
        bail!("invalid target '{spec}', query is empty");
    }

    let mut target = DiscoveryTarget::query(parse_source(source.trim())?, query)
        .with_max_pages(config.discovery.max_pages);
    if let Some(cadence) = config.default_cadence() {
        target = target.with_cadence(cadence);
    }
    Ok(target)
}

fn build_pipeline<Q, S, O>(
    config: &PipelineConfig,
    queue: Q,
    snapshots: S,
    opportunities: O,
) -> Result<HttpPipeline<Q, S, O>>
where
    Q: JobQueue + 'static,
    S: SnapshotStore + 'static,
    O: OpportunityStore + 'static,
{
    let parts = PipelineParts {
        queue,
        snapshots,
        fetcher: HttpPageFetcher::with_timeout(config.fetch_timeout()),
        parser: listing_parser(config)?,
        discovery: discovery_source(config)?,
        predictor: Predictor::from_config(config)?,
        shipping: Shipping::from_config(config)?,
        opportunities,
    };
    Ok(Pipeline::build(parts, config)?)
}

async fn cmd_run(config: &PipelineConfig, memory: bool, targets: &[String]) -> Result<()> {
    if config.scoring.predictor_url.is_none() {
        bail!("[scoring].predictor_url must be set to run the pipeline");
    }
    let targets = targets
        .iter()
        .map(|t| parse_target(t, config))
        .collect::<Result<Vec<_>>>()?;

    if memory {
        tracing::warn!("Running with in-memory state; nothing survives this process");
        let pipeline = build_pipeline(
            config,
            MemoryJobQueue::new(),
            MemorySnapshotStore::new(),
            MemoryOpportunityStore::new(),
        )?;
        run_until_interrupted(&pipeline, targets).await
    } else {
        let db = connect_db().await?;
        let pipeline = build_pipeline(
            config,
            db.job_repo(),
            db.snapshot_repo(),
            db.opportunity_repo(),
        )?;
        run_until_interrupted(&pipeline, targets).await
    }
}

async fn run_until_interrupted<Q, S, O>(
    pipeline: &HttpPipeline<Q, S, O>,
    targets: Vec<DiscoveryTarget>,
) -> Result<()>
where
    Q: JobQueue + 'static,
    S: SnapshotStore + 'static,
    O: OpportunityStore + 'static,
{
    let started = Utc::now();
    for target in targets {
        pipeline.submit_discovery_target(target)?;
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                signal_token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    pipeline
        .run(cancel, Arc::new(TracingReporter))
        .await
        .context("Pipeline failed")?;

    let found = pipeline
        .get_opportunities(started, RUN_SUMMARY_LIMIT)
        .await?;
    print_opportunities(&found);
    Ok(())
}

async fn cmd_discover(
    config: &PipelineConfig,
    source: &str,
    query: &str,
    pages: Option<u32>,
) -> Result<()> {
    let pages = pages.unwrap_or(config.discovery.max_pages);
    if pages == 0 {
        bail!("--pages must be at least 1");
    }
    let target = DiscoveryTarget::query(parse_source(source)?, query).with_max_pages(pages);

    tracing::info!(%source, %query, pages, "Discovering listings");
    let discovery =
        discovery_source(config)?.with_governor(RateGovernor::new(config.rate_governor())?);
    let refs = DiscoveryCursor::new(discovery, target)
        .collect()
        .await
        .context("Discovery failed")?;

    for listing in &refs {
        println!("{}\t{}", listing.key(), listing.url);
    }
    tracing::info!(found = refs.len(), "Discovery complete");
    Ok(())
}

async fn cmd_fetch(config: &PipelineConfig, source: &str, id: &str, url: &str) -> Result<()> {
    let worker = FetchWorker::new(
        HttpPageFetcher::with_timeout(config.fetch_timeout()),
        listing_parser(config)?,
        IdentityRotator::new(config.identities(), config.rotator())?,
        RateGovernor::new(config.rate_governor())?,
        config.fetch_timeout(),
    );
    let listing = ListingRef::new(parse_source(source)?, id, url);

    tracing::info!("Fetching {}", listing.url);
    let snapshot = worker
        .fetch(&listing)
        .await
        .with_context(|| format!("Failed to fetch {}", listing.key()))?;

    tracing::info!(
        content_hash = %&snapshot.content_hash[..8],
        raw_size = snapshot.raw_size,
        "Listing parsed"
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn print_status(status: &PipelineStatus) {
    println!("Jobs:");
    for state in JobState::ALL {
        println!("  {:<16} {}", state.as_str(), status.count(state));
    }
    println!("\nSnapshots: {}", status.snapshots);

    if !status.dead_letters.is_empty() {
        println!("\nDead letters (most recent first):");
        for dead in &status.dead_letters {
            println!(
                "  [{}] {} after {} attempt(s) at {}: {}",
                dead.kind.map_or("unknown", |k| k.as_str()),
                dead.listing,
                dead.attempt,
                dead.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
                dead.reason.as_deref().unwrap_or("-"),
            );
        }
    }

    if !status.suppressed.is_empty() {
        println!("\nSuppressed opportunities (most recent first):");
        for record in &status.suppressed {
            println!(
                "  {} margin {:.2} (value {:.2}, cost {:.2}) at {}",
                record.listing.key(),
                record.margin,
                record.predicted_value,
                record.total_cost,
                record.computed_at.format("%Y-%m-%d %H:%M:%S UTC"),
            );
        }
    }
}

fn print_opportunities(records: &[OpportunityRecord]) {
    if records.is_empty() {
        println!("No opportunities found");
        return;
    }
    for record in records {
        println!(
            "  {} margin {:.2} = value {:.2} - (price {:.2} + fees {:.2} + shipping {:.2})  {}",
            record.listing.key(),
            record.margin,
            record.predicted_value,
            record.listing_cost,
            record.fees,
            record.shipping_cost,
            record.listing.url,
        );
    }
    println!("\nTotal: {} opportunities", records.len());
}

#[derive(Serialize)]
struct OpportunityCsvRow<'a> {
    source: &'a str,
    external_id: &'a str,
    url: &'a str,
    predicted_value: f64,
    listing_cost: f64,
    fees: f64,
    shipping_cost: f64,
    total_cost: f64,
    margin: f64,
    computed_at: String,
    snapshot_hash: &'a str,
}

impl<'a> From<&'a OpportunityRecord> for OpportunityCsvRow<'a> {
    fn from(record: &'a OpportunityRecord) -> Self {
        Self {
            source: record.listing.source.as_str(),
            external_id: &record.listing.external_id,
            url: &record.listing.url,
            predicted_value: record.predicted_value,
            listing_cost: record.listing_cost,
            fees: record.fees,
            shipping_cost: record.shipping_cost,
            total_cost: record.total_cost,
            margin: record.margin,
            computed_at: record.computed_at.to_rfc3339(),
            snapshot_hash: &record.snapshot_hash,
        }
    }
}

fn write_csv<W: Write>(records: &[OpportunityRecord], writer: W) -> Result<()> {
    let mut csv_writer = csv::WriterBuilder::new().from_writer(writer);
    for record in records {
        csv_writer.serialize(OpportunityCsvRow::from(record))?;
    }
    csv_writer.flush()?;
    Ok(())
}
