use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use terreno_crawl::{crawler_for_target, Crawler, FixtureCrawler, HttpClientConfig, HttpFetcher};
use terreno_pipeline::{run_once, PipelineConfig, RunError, RunOptions, RunSummary};
use terreno_store::PgListingStore;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "terreno")]
#[command(about = "Land-listing ingest: crawl, normalize, dedup, load")]
struct Cli {
    /// Crawl target to run, e.g. "argenprop"
    target: String,

    /// Maximum number of listing pages to traverse
    #[arg(long)]
    pages: Option<u32>,

    /// Crawl budget in seconds; exceeding it fails the run
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Compute the full pipeline result but skip the load step
    #[arg(long)]
    dry_run: bool,

    /// Read raw records from a JSON fixture file instead of the network
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(summary) => {
            println!(
                "run {}: outcome={:?} raw={} rejected={} dupes={}+{} survivors={} rows_written={}",
                summary.run_id,
                summary.outcome,
                summary.raw_records,
                summary.rejected,
                summary.internal_dropped,
                summary.external_dropped,
                summary.survivors,
                summary.rows_written,
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            exit_code_for(&err)
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let config = PipelineConfig::from_env().map_err(RunError::from)?;

    let store = PgListingStore::connect(&config.database_url, &config.table)
        .await
        .context("connecting to listing store")?;

    let crawler: Box<dyn Crawler> = match cli.fixture {
        Some(path) => Box::new(FixtureCrawler::new(path)),
        None => {
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: config.user_agent.clone(),
                ..Default::default()
            })
            .map_err(RunError::from)?;
            crawler_for_target(&cli.target, fetcher)
                .ok_or_else(|| RunError::UnknownTarget(cli.target.clone()))?
        }
    };

    let options = RunOptions {
        target: cli.target,
        page_limit: cli.pages,
        timeout: Duration::from_secs(cli.timeout),
        dry_run: cli.dry_run,
    };

    let summary = run_once(&options, crawler.as_ref(), &store, &config.output_path).await?;
    Ok(summary)
}

/// 0 on DONE, 2 on crawl timeout, 3 on load failure, 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<RunError>() {
        Some(RunError::CrawlTimeout { .. }) => ExitCode::from(2),
        Some(RunError::Load(_)) => ExitCode::from(3),
        _ => ExitCode::FAILURE,
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
