//! Normalization → deduplication → load pipeline and the run-lifecycle
//! orchestrator.
//!
//! One run walks INIT → CRAWL → VALIDATE_NORMALIZE → DEDUP →
//! (DRY_RUN_SKIP | LOAD) → DONE, failing out of CRAWL on timeout and out of
//! LOAD on an unrecoverable chunk write.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use terreno_core::{Currency, Listing, RawListing, StoredListing};
use terreno_crawl::{CrawlError, Crawler};
use terreno_store::{ListingStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "terreno-pipeline";

/// Upper bound on rows per store write; bounds memory and transaction size.
pub const CHUNK_SIZE: usize = 500;

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
}

/// Process-level configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub table: String,
    pub output_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;
        Ok(Self {
            database_url,
            table: std::env::var("TERRENO_TABLE").unwrap_or_else(|_| "listings".to_string()),
            output_path: std::env::var("TERRENO_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("outputs/listings.json")),
            user_agent: std::env::var("TERRENO_USER_AGENT")
                .unwrap_or_else(|_| "terreno-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("TERRENO_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }
}

// ---------------------------------------------------------------------------
// Normalizer

/// Why one raw record was dropped during normalization. Per-record, never
/// escalated to a run failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing required field 'title'")]
    MissingTitle,
    #[error("missing required field 'price'")]
    MissingPrice,
    #[error("missing required field 'link'")]
    MissingLink,
    #[error("unparseable price {0:?}")]
    InvalidPrice(String),
}

#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub listings: Vec<Listing>,
    pub rejected: usize,
}

/// Validate and coerce one raw record into a canonical [`Listing`].
pub fn normalize(raw: &RawListing) -> Result<Listing, Rejection> {
    let title = raw
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(Rejection::MissingTitle)?;
    let price_text = raw
        .price
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or(Rejection::MissingPrice)?;
    let (price, currency) = parse_price(price_text)?;
    let link = raw
        .link
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or(Rejection::MissingLink)?;

    Ok(Listing {
        title: title.to_string(),
        address: trimmed_opt(raw.address.as_deref()),
        description: trimmed_opt(raw.description.as_deref()),
        price,
        currency,
        area: trimmed_opt(raw.area.as_deref()),
        link: link.to_string(),
        lat: parse_coord(raw.lat.as_deref()),
        lon: parse_coord(raw.lon.as_deref()),
    })
}

/// Normalize a whole crawl batch, logging one audit line per rejection.
pub fn normalize_batch(raw: Vec<RawListing>) -> NormalizedBatch {
    let mut listings = Vec::with_capacity(raw.len());
    let mut rejected = 0usize;

    for record in &raw {
        match normalize(record) {
            Ok(listing) => listings.push(listing),
            Err(reason) => {
                rejected += 1;
                warn!(
                    title = record.title.as_deref().unwrap_or("<untitled>"),
                    %reason,
                    "record rejected"
                );
            }
        }
    }

    NormalizedBatch { listings, rejected }
}

/// Parse localized price text like `"US$ 35.000"` or `"$ 1.200.000"` into a
/// value and its currency. Currency tokens are stripped longest-first so
/// `US$` never leaves a stray `US` behind.
fn parse_price(text: &str) -> Result<(f64, Currency), Rejection> {
    let upper = text.to_uppercase();
    let currency = if upper.contains("USD") || upper.contains("US$") {
        Currency::Usd
    } else {
        Currency::Ars
    };

    let cleaned = upper
        .replace("US$", "")
        .replace("USD", "")
        .replace(['$', '.', ','], "");
    cleaned
        .trim()
        .parse::<f64>()
        .map(|price| (price, currency))
        .map_err(|_| Rejection::InvalidPrice(text.to_string()))
}

fn trimmed_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Coordinates are optional: `None`, empty, `"-"`, or an unparseable value
/// all yield `None` for that axis without rejecting the record.
fn parse_coord(raw: Option<&str>) -> Option<f64> {
    let text = raw.map(str::trim).filter(|t| !t.is_empty() && *t != "-")?;
    match text.parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            debug!(value = text, "unparseable coordinate, keeping null");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Deduplicator

#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub survivors: Vec<Listing>,
    pub internal_dropped: usize,
    pub external_dropped: usize,
}

/// Drop within-batch duplicates by (title, address, price), first occurrence
/// wins, arrival order preserved.
pub fn dedup_internal(batch: Vec<Listing>) -> (Vec<Listing>, usize) {
    let mut seen = HashSet::with_capacity(batch.len());
    let mut kept = Vec::with_capacity(batch.len());
    let mut dropped = 0usize;

    for listing in batch {
        if seen.insert(listing.dedup_key()) {
            kept.push(listing);
        } else {
            dropped += 1;
        }
    }

    (kept, dropped)
}

/// Both dedup passes: internal by composite key, then external against the
/// store's link set (one membership query). Idempotent across runs.
pub async fn dedup_batch(
    batch: Vec<Listing>,
    store: &dyn ListingStore,
) -> Result<DedupOutcome, StoreError> {
    let (kept, internal_dropped) = dedup_internal(batch);

    let existing = store.existing_links().await?;
    let before = kept.len();
    let survivors: Vec<Listing> = kept
        .into_iter()
        .filter(|listing| !existing.contains(&listing.link))
        .collect();
    let external_dropped = before - survivors.len();

    if internal_dropped + external_dropped > 0 {
        info!(internal_dropped, external_dropped, "duplicates filtered");
    }

    Ok(DedupOutcome {
        survivors,
        internal_dropped,
        external_dropped,
    })
}

// ---------------------------------------------------------------------------
// Loader

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoadReport {
    pub rows_written: usize,
    pub chunks_written: usize,
}

/// A chunk write failed. Chunks committed before it stay persisted; each
/// chunk is one transaction, so the failing chunk itself leaves nothing
/// behind.
#[derive(Debug, Error)]
#[error("chunk {chunk_index} failed after {rows_committed} rows committed: {source}")]
pub struct LoadError {
    pub chunk_index: usize,
    pub rows_committed: usize,
    #[source]
    pub source: StoreError,
}

/// Assign identity and timestamp to survivors and write them in bounded
/// chunks. An empty survivor set performs no store access at all.
pub async fn load(
    store: &dyn ListingStore,
    survivors: Vec<Listing>,
    chunk_size: usize,
) -> Result<LoadReport, LoadError> {
    if survivors.is_empty() {
        return Ok(LoadReport::default());
    }

    store
        .ensure_schema()
        .await
        .map_err(|source| LoadError {
            chunk_index: 0,
            rows_committed: 0,
            source,
        })?;

    let created_at = Utc::now();
    let rows: Vec<StoredListing> = survivors
        .into_iter()
        .map(|listing| StoredListing::from_listing(listing, Uuid::new_v4(), created_at))
        .collect();

    let mut report = LoadReport::default();
    for (chunk_index, chunk) in rows.chunks(chunk_size).enumerate() {
        store
            .insert_chunk(chunk)
            .await
            .map_err(|source| LoadError {
                chunk_index,
                rows_committed: report.rows_written,
                source,
            })?;
        report.rows_written += chunk.len();
        report.chunks_written += 1;
        debug!(chunk_index, rows = chunk.len(), "chunk written");
    }

    info!(
        rows = report.rows_written,
        chunks = report.chunks_written,
        "load complete"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Orchestrator

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Survivors were written to the store.
    Loaded,
    /// Dry-run flag set; survivors computed and reported, nothing written.
    DryRun,
    /// Deduplication left nothing to write; the loader was never invoked.
    NoNewData,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_records: usize,
    pub rejected: usize,
    pub internal_dropped: usize,
    pub external_dropped: usize,
    pub survivors: usize,
    pub rows_written: usize,
    pub outcome: RunOutcome,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no crawler registered for target {0:?}")]
    UnknownTarget(String),
    #[error("crawl exceeded its {budget_secs}s budget")]
    CrawlTimeout { budget_secs: u64 },
    #[error("crawl failed: {0}")]
    Crawl(#[from] CrawlError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("load failed: {0}")]
    Load(#[from] LoadError),
    #[error("writing run artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding run artifact: {0}")]
    ArtifactEncode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: String,
    pub page_limit: Option<u32>,
    pub timeout: Duration,
    pub dry_run: bool,
}

/// Drive one full run. The crawl phase runs under a hard time budget; on
/// timeout any partially fetched records are discarded wholesale.
pub async fn run_once(
    options: &RunOptions,
    crawler: &dyn Crawler,
    store: &dyn ListingStore,
    artifact_path: &Path,
) -> Result<RunSummary, RunError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(
        %run_id,
        target = %options.target,
        dry_run = options.dry_run,
        "run started"
    );

    clear_artifact(artifact_path).await?;

    let raw = match tokio::time::timeout(options.timeout, crawler.crawl(options.page_limit)).await
    {
        Ok(result) => result?,
        Err(_) => {
            error!(
                budget_secs = options.timeout.as_secs(),
                "crawl timed out, discarding partial batch"
            );
            return Err(RunError::CrawlTimeout {
                budget_secs: options.timeout.as_secs(),
            });
        }
    };
    let raw_records = raw.len();

    let batch = normalize_batch(raw);
    write_artifact(artifact_path, &batch.listings).await?;

    let outcome = dedup_batch(batch.listings, store).await?;
    let survivors = outcome.survivors.len();

    let (run_outcome, rows_written) = if survivors == 0 {
        info!("no new data, skipping load");
        (RunOutcome::NoNewData, 0)
    } else if options.dry_run {
        info!(survivors, "dry run, skipping load");
        (RunOutcome::DryRun, 0)
    } else {
        let report = load(store, outcome.survivors, CHUNK_SIZE).await?;
        (RunOutcome::Loaded, report.rows_written)
    };

    let summary = RunSummary {
        run_id,
        target: options.target.clone(),
        started_at,
        finished_at: Utc::now(),
        raw_records,
        rejected: batch.rejected,
        internal_dropped: outcome.internal_dropped,
        external_dropped: outcome.external_dropped,
        survivors,
        rows_written,
        outcome: run_outcome,
    };
    info!(
        outcome = ?summary.outcome,
        raw = summary.raw_records,
        survivors = summary.survivors,
        rows_written = summary.rows_written,
        "run finished"
    );
    Ok(summary)
}

/// INIT: remove the previous run's artifact so stale records never leak into
/// this run's output.
async fn clear_artifact(path: &Path) -> Result<(), RunError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale artifact");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RunError::Artifact {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn write_artifact(path: &Path, listings: &[Listing]) -> Result<(), RunError> {
    let io_err = |source| RunError::Artifact {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }
    let bytes = serde_json::to_vec_pretty(listings)?;
    tokio::fs::write(path, bytes).await.map_err(io_err)?;
    debug!(path = %path.display(), records = listings.len(), "artifact written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use terreno_store::MemoryListingStore;

    fn raw(title: &str, price: &str, link: &str) -> RawListing {
        RawListing {
            title: Some(title.to_string()),
            price: Some(price.to_string()),
            link: Some(link.to_string()),
            ..RawListing::default()
        }
    }

    fn listing(title: &str, address: Option<&str>, price: f64, link: &str) -> Listing {
        Listing {
            title: title.to_string(),
            address: address.map(str::to_string),
            description: None,
            price,
            currency: Currency::Ars,
            area: None,
            link: link.to_string(),
            lat: None,
            lon: None,
        }
    }

    struct StaticCrawler {
        records: Vec<RawListing>,
    }

    #[async_trait]
    impl Crawler for StaticCrawler {
        fn target_id(&self) -> &'static str {
            "static"
        }

        async fn crawl(&self, _page_limit: Option<u32>) -> Result<Vec<RawListing>, CrawlError> {
            Ok(self.records.clone())
        }
    }

    struct SlowCrawler;

    #[async_trait]
    impl Crawler for SlowCrawler {
        fn target_id(&self) -> &'static str {
            "slow"
        }

        async fn crawl(&self, _page_limit: Option<u32>) -> Result<Vec<RawListing>, CrawlError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn options(dry_run: bool) -> RunOptions {
        RunOptions {
            target: "static".to_string(),
            page_limit: None,
            timeout: Duration::from_secs(5),
            dry_run,
        }
    }

    // -- normalizer -------------------------------------------------------

    #[test]
    fn usd_price_with_symbol_marker_parses() {
        let result = normalize(&raw("Terreno", "US$ 35.000", "http://x/1")).unwrap();
        assert_eq!(result.price, 35000.0);
        assert_eq!(result.currency, Currency::Usd);
    }

    #[test]
    fn peso_price_defaults_to_ars() {
        let result = normalize(&raw("Terreno", "$ 1.200.000", "http://x/1")).unwrap();
        assert_eq!(result.price, 1200000.0);
        assert_eq!(result.currency, Currency::Ars);
    }

    #[test]
    fn missing_title_and_price_reject() {
        let no_title = RawListing {
            price: Some("USD 10.000".to_string()),
            link: Some("http://x/1".to_string()),
            ..RawListing::default()
        };
        assert_eq!(normalize(&no_title), Err(Rejection::MissingTitle));

        let blank_title = RawListing {
            title: Some("   ".to_string()),
            price: Some("USD 10.000".to_string()),
            link: Some("http://x/1".to_string()),
            ..RawListing::default()
        };
        assert_eq!(normalize(&blank_title), Err(Rejection::MissingTitle));

        let no_price = RawListing {
            title: Some("Terreno".to_string()),
            link: Some("http://x/1".to_string()),
            ..RawListing::default()
        };
        assert_eq!(normalize(&no_price), Err(Rejection::MissingPrice));
    }

    #[test]
    fn unparseable_price_rejects_with_original_text() {
        assert_eq!(
            normalize(&raw("Terreno", "Consultar precio", "http://x/1")),
            Err(Rejection::InvalidPrice("Consultar precio".to_string()))
        );
    }

    #[test]
    fn optional_fields_are_trimmed_not_required() {
        let record = RawListing {
            title: Some("  Terreno en venta  ".to_string()),
            description: Some("  lote esquina  ".to_string()),
            address: Some("  Av. Mitre 100  ".to_string()),
            price: Some("USD 20.000".to_string()),
            area: Some("600 m²".to_string()),
            link: Some("http://x/1".to_string()),
            lat: None,
            lon: None,
        };
        let result = normalize(&record).unwrap();
        assert_eq!(result.title, "Terreno en venta");
        assert_eq!(result.description.as_deref(), Some("lote esquina"));
        assert_eq!(result.address.as_deref(), Some("Av. Mitre 100"));
        assert_eq!(result.area.as_deref(), Some("600 m²"));
    }

    #[test]
    fn bad_coordinates_never_reject() {
        let mut record = raw("Terreno", "USD 20.000", "http://x/1");
        record.lat = Some("not-a-number".to_string());
        record.lon = Some("-".to_string());
        let result = normalize(&record).unwrap();
        assert_eq!(result.lat, None);
        assert_eq!(result.lon, None);

        record.lat = Some("-27.3671".to_string());
        record.lon = Some("-55.8961".to_string());
        let result = normalize(&record).unwrap();
        assert_eq!(result.lat, Some(-27.3671));
        assert_eq!(result.lon, Some(-55.8961));
    }

    #[test]
    fn batch_drops_rejections_and_counts_them() {
        let batch = normalize_batch(vec![
            raw("A", "USD 10.000", "http://x/1"),
            RawListing::default(),
            raw("B", "Consultar precio", "http://x/2"),
        ]);
        assert_eq!(batch.listings.len(), 1);
        assert_eq!(batch.rejected, 2);
    }

    // -- deduplicator -----------------------------------------------------

    #[test]
    fn internal_dedup_keeps_first_occurrence() {
        let batch = vec![
            listing("A", Some("X"), 10.0, "http://x/1"),
            listing("A", Some("X"), 10.0, "http://x/2"),
            listing("B", Some("Y"), 5.0, "http://x/3"),
        ];
        let (kept, dropped) = dedup_internal(batch);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].link, "http://x/1");
        assert_eq!(kept[1].title, "B");
    }

    #[test]
    fn differing_address_is_not_a_duplicate() {
        let batch = vec![
            listing("A", Some("X"), 10.0, "http://x/1"),
            listing("A", Some("Z"), 10.0, "http://x/2"),
            listing("A", None, 10.0, "http://x/3"),
        ];
        let (kept, dropped) = dedup_internal(batch);
        assert_eq!(dropped, 0);
        assert_eq!(kept.len(), 3);
    }

    #[tokio::test]
    async fn external_dedup_filters_stored_links_regardless_of_fields() {
        let store = MemoryListingStore::new();
        load(
            &store,
            vec![listing("Old title", Some("Old"), 99.0, "http://x/1")],
            CHUNK_SIZE,
        )
        .await
        .unwrap();

        let outcome = dedup_batch(
            vec![
                listing("Brand new title", Some("New"), 1.0, "http://x/1"),
                listing("B", Some("Y"), 5.0, "http://x/2"),
            ],
            &store,
        )
        .await
        .unwrap();

        assert_eq!(outcome.external_dropped, 1);
        assert_eq!(outcome.survivors.len(), 1);
        assert_eq!(outcome.survivors[0].link, "http://x/2");
    }

    #[tokio::test]
    async fn survivor_order_matches_arrival_order() {
        let store = MemoryListingStore::new();
        let batch: Vec<Listing> = (0..10)
            .map(|i| listing(&format!("T{i}"), None, i as f64, &format!("http://x/{i}")))
            .collect();
        let outcome = dedup_batch(batch.clone(), &store).await.unwrap();
        assert_eq!(outcome.survivors, batch);
    }

    // -- loader -----------------------------------------------------------

    #[tokio::test]
    async fn empty_survivors_touch_the_store_not_at_all() {
        let store = MemoryListingStore::new();
        let report = load(&store, Vec::new(), CHUNK_SIZE).await.unwrap();
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.chunks_written, 0);
        assert_eq!(store.schema_calls(), 0);
        assert!(store.insert_calls().is_empty());
    }

    #[tokio::test]
    async fn load_writes_in_bounded_chunks() {
        let store = MemoryListingStore::new();
        let survivors: Vec<Listing> = (0..1200)
            .map(|i| listing(&format!("T{i}"), None, i as f64, &format!("http://x/{i}")))
            .collect();

        let report = load(&store, survivors, CHUNK_SIZE).await.unwrap();
        assert_eq!(report.rows_written, 1200);
        assert_eq!(report.chunks_written, 3);
        assert_eq!(store.insert_calls(), vec![500, 500, 200]);
        assert!(store.insert_calls().iter().all(|&size| size <= CHUNK_SIZE));
        assert_eq!(store.schema_calls(), 1);
    }

    #[tokio::test]
    async fn load_assigns_identity_exactly_once() {
        let store = MemoryListingStore::new();
        load(
            &store,
            vec![
                listing("A", None, 1.0, "http://x/1"),
                listing("B", None, 2.0, "http://x/2"),
            ],
            CHUNK_SIZE,
        )
        .await
        .unwrap();

        let rows = store.rows();
        assert_eq!(rows.len(), 2);
        assert_ne!(rows[0].id, rows[1].id);
    }

    #[tokio::test]
    async fn chunk_failure_keeps_prior_chunks_committed() {
        let store = MemoryListingStore::failing_on_chunk(1);
        let survivors: Vec<Listing> = (0..5)
            .map(|i| listing(&format!("T{i}"), None, i as f64, &format!("http://x/{i}")))
            .collect();

        let err = load(&store, survivors, 2).await.expect_err("chunk 1 fails");
        assert_eq!(err.chunk_index, 1);
        assert_eq!(err.rows_committed, 2);
        assert_eq!(store.rows().len(), 2);
    }

    // -- orchestrator -----------------------------------------------------

    fn artifact_in(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("listings.json")
    }

    #[tokio::test]
    async fn full_run_loads_survivors_and_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = StaticCrawler {
            records: vec![
                raw("A", "USD 10.000", "http://x/1"),
                raw("A", "USD 10.000", "http://x/1"),
                raw("B", "$ 5.000", "http://x/2"),
                RawListing::default(),
            ],
        };
        let store = MemoryListingStore::new();

        let summary = run_once(&options(false), &crawler, &store, &artifact_in(&dir))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Loaded);
        assert_eq!(summary.raw_records, 4);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.internal_dropped, 1);
        assert_eq!(summary.survivors, 2);
        assert_eq!(summary.rows_written, 2);
        assert_eq!(store.rows().len(), 2);
    }

    #[tokio::test]
    async fn second_identical_run_persists_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = StaticCrawler {
            records: vec![
                raw("A", "USD 10.000", "http://x/1"),
                raw("B", "$ 5.000", "http://x/2"),
            ],
        };
        let store = MemoryListingStore::new();
        let artifact = artifact_in(&dir);

        let first = run_once(&options(false), &crawler, &store, &artifact)
            .await
            .unwrap();
        assert_eq!(first.rows_written, 2);

        let second = run_once(&options(false), &crawler, &store, &artifact)
            .await
            .unwrap();
        assert_eq!(second.outcome, RunOutcome::NoNewData);
        assert_eq!(second.external_dropped, 2);
        assert_eq!(second.rows_written, 0);
        assert_eq!(store.rows().len(), 2);
    }

    #[tokio::test]
    async fn empty_survivors_reach_done_without_store_writes() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = StaticCrawler {
            records: vec![RawListing::default()],
        };
        let store = MemoryListingStore::new();

        let summary = run_once(&options(false), &crawler, &store, &artifact_in(&dir))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::NoNewData);
        assert_eq!(store.schema_calls(), 0);
        assert!(store.insert_calls().is_empty());
    }

    #[tokio::test]
    async fn dry_run_reports_survivors_but_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = StaticCrawler {
            records: vec![
                raw("A", "USD 10.000", "http://x/1"),
                raw("B", "$ 5.000", "http://x/2"),
            ],
        };
        let store = MemoryListingStore::new();

        let summary = run_once(&options(true), &crawler, &store, &artifact_in(&dir))
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::DryRun);
        assert_eq!(summary.survivors, 2);
        assert_eq!(summary.rows_written, 0);
        assert_eq!(store.schema_calls(), 0);
        assert!(store.insert_calls().is_empty());
    }

    #[tokio::test]
    async fn crawl_timeout_fails_the_run_before_any_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryListingStore::new();
        let opts = RunOptions {
            target: "slow".to_string(),
            page_limit: None,
            timeout: Duration::from_millis(50),
            dry_run: false,
        };

        let err = run_once(&opts, &SlowCrawler, &store, &artifact_in(&dir))
            .await
            .expect_err("must time out");

        assert!(matches!(err, RunError::CrawlTimeout { .. }));
        assert!(store.insert_calls().is_empty());
    }

    #[tokio::test]
    async fn load_failure_fails_the_run_but_keeps_committed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let crawler = StaticCrawler {
            records: vec![
                raw("A", "USD 10.000", "http://x/1"),
                raw("B", "$ 5.000", "http://x/2"),
            ],
        };
        // CHUNK_SIZE exceeds two records, so everything lands in chunk 0 and
        // the injected failure aborts before any row is committed.
        let store = MemoryListingStore::failing_on_chunk(0);

        let err = run_once(&options(false), &crawler, &store, &artifact_in(&dir))
            .await
            .expect_err("load must fail");

        assert!(matches!(err, RunError::Load(_)));
        assert!(store.rows().is_empty());
    }

    #[tokio::test]
    async fn init_clears_stale_artifact_and_run_rewrites_it() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(&dir);
        std::fs::write(&artifact, "[{\"stale\": true}]").unwrap();

        let crawler = StaticCrawler {
            records: vec![raw("A", "USD 10.000", "http://x/1")],
        };
        let store = MemoryListingStore::new();
        run_once(&options(false), &crawler, &store, &artifact)
            .await
            .unwrap();

        let text = std::fs::read_to_string(&artifact).unwrap();
        let round_trip: Vec<Listing> = serde_json::from_str(&text).unwrap();
        assert_eq!(round_trip.len(), 1);
        assert_eq!(round_trip[0].title, "A");
        assert_eq!(round_trip[0].price, 10000.0);
        assert_eq!(round_trip[0].currency, Currency::Usd);
    }

    #[tokio::test]
    async fn timed_out_run_leaves_no_artifact_behind() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact_in(&dir);
        std::fs::write(&artifact, "[]").unwrap();

        let store = MemoryListingStore::new();
        let opts = RunOptions {
            target: "slow".to_string(),
            page_limit: None,
            timeout: Duration::from_millis(50),
            dry_run: false,
        };
        let _ = run_once(&opts, &SlowCrawler, &store, &artifact).await;

        assert!(!artifact.exists());
    }
}
