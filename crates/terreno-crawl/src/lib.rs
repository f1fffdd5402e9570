//! Crawler collaborator: HTTP fetching plus per-target listing crawlers.
//!
//! The pipeline only sees the [`Crawler`] trait: a target yields one finite
//! batch of [`RawListing`] records or fails. Pagination and retries live
//! entirely behind that seam.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use terreno_core::RawListing;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "terreno-crawl";

pub const ARGENPROP_BASE_URL: &str = "https://www.argenprop.com";
const ARGENPROP_START_PATH: &str = "/terrenos/venta/posadas";

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing fixture {path}: {source}")]
    FixtureFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "terreno-bot/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Page fetcher with bounded exponential backoff on 5xx/429 and transient
/// transport errors. Listing pages are traversed sequentially, so there is no
/// concurrency control here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(CrawlError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// A crawl target: produces one finite batch of raw records per invocation.
#[async_trait]
pub trait Crawler: Send + Sync {
    fn target_id(&self) -> &'static str;

    /// Crawl up to `page_limit` listing pages (unlimited when `None`).
    async fn crawl(&self, page_limit: Option<u32>) -> Result<Vec<RawListing>, CrawlError>;
}

/// Argenprop land listings for Posadas: card parsing plus sequential
/// next-page traversal.
pub struct ArgenpropCrawler {
    base_url: String,
    fetcher: HttpFetcher,
}

impl ArgenpropCrawler {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self {
            base_url: ARGENPROP_BASE_URL.to_string(),
            fetcher,
        }
    }

    pub fn with_base_url(fetcher: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            fetcher,
        }
    }
}

#[async_trait]
impl Crawler for ArgenpropCrawler {
    fn target_id(&self) -> &'static str {
        "argenprop"
    }

    async fn crawl(&self, page_limit: Option<u32>) -> Result<Vec<RawListing>, CrawlError> {
        let mut url = resolve_href(&self.base_url, ARGENPROP_START_PATH);
        let mut page = 1u32;
        let mut records = Vec::new();

        loop {
            info!(page, %url, "fetching listing page");
            let html = self.fetcher.fetch_text(&url).await?;
            let parsed = parse_listing_page(&html, &self.base_url)?;
            if parsed.listings.is_empty() {
                warn!(%url, "no listing cards found");
            }
            records.extend(parsed.listings);

            match parsed.next_page {
                Some(next) if page_limit.map_or(true, |limit| page < limit) => {
                    url = next;
                    page += 1;
                }
                _ => break,
            }
        }

        info!(records = records.len(), pages = page, "crawl finished");
        Ok(records)
    }
}

/// One parsed listing page: its cards plus the absolute next-page URL, if any.
#[derive(Debug, Clone)]
pub struct ParsedPage {
    pub listings: Vec<RawListing>,
    pub next_page: Option<String>,
}

fn sel(selector: &str) -> Result<Selector, CrawlError> {
    Selector::parse(selector).map_err(|err| CrawlError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_text(node: ElementRef<'_>, selector: &Selector) -> Option<String> {
    node.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// First run of digits with embedded thousands/decimal separators, e.g.
/// `"1.200.000"` out of `"$ 1.200.000"`.
pub fn first_number_token(text: &str) -> Option<String> {
    let mut token = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() || (!token.is_empty() && (ch == '.' || ch == ',')) {
            token.push(ch);
        } else if !token.is_empty() {
            break;
        }
    }
    let token = token.trim_end_matches(['.', ',']).to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Join a possibly relative href against the site base URL.
pub fn resolve_href(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        href.trim_start_matches('/')
    )
}

pub fn parse_listing_page(html: &str, base_url: &str) -> Result<ParsedPage, CrawlError> {
    let card_sel = sel("div.listing__item")?;
    let title_sel = sel("p.card__title--primary")?;
    let info_sel = sel("p.card__info")?;
    let address_sel = sel("p.card__address")?;
    let price_sel = sel("p.card__price")?;
    let currency_sel = sel("p.card__price span.card__currency")?;
    let feature_sel = sel("ul.card__main-features li span")?;
    let link_sel = sel("a[href]")?;
    let next_sel = sel("li.pagination__page-next a[href]")?;

    let document = Html::parse_document(html);
    let mut listings = Vec::new();

    for card in document.select(&card_sel) {
        let currency = first_text(card, &currency_sel);
        let price_text = card
            .select(&price_sel)
            .next()
            .map(|n| n.text().collect::<String>())
            .unwrap_or_default();
        let price = match first_number_token(&price_text) {
            Some(value) => Some(
                format!("{} {}", currency.as_deref().unwrap_or_default(), value)
                    .trim()
                    .to_string(),
            ),
            None => Some("Consultar precio".to_string()),
        };

        let area = card
            .select(&feature_sel)
            .filter_map(|n| text_or_none(n.text().collect::<String>()))
            .find(|s| s.contains("m²"));

        let link = card
            .select(&link_sel)
            .next()
            .and_then(|n| n.value().attr("href"))
            .map(|href| resolve_href(base_url, href));

        let record = RawListing {
            title: first_text(card, &title_sel),
            description: first_text(card, &info_sel),
            address: first_text(card, &address_sel),
            price,
            area,
            link,
            lat: None,
            lon: None,
        };
        debug!(
            title = record.title.as_deref().unwrap_or("<untitled>"),
            price = record.price.as_deref().unwrap_or_default(),
            "card extracted"
        );
        listings.push(record);
    }

    let next_page = document
        .select(&next_sel)
        .next()
        .and_then(|n| n.value().attr("href"))
        .map(|href| resolve_href(base_url, href));

    Ok(ParsedPage {
        listings,
        next_page,
    })
}

/// Offline crawler reading a JSON array of raw records from a file.
pub struct FixtureCrawler {
    path: PathBuf,
}

impl FixtureCrawler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Crawler for FixtureCrawler {
    fn target_id(&self) -> &'static str {
        "fixture"
    }

    async fn crawl(&self, page_limit: Option<u32>) -> Result<Vec<RawListing>, CrawlError> {
        let _ = page_limit;
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| CrawlError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|source| CrawlError::FixtureFormat {
            path: self.path.clone(),
            source,
        })
    }
}

pub fn crawler_for_target(target: &str, fetcher: HttpFetcher) -> Option<Box<dyn Crawler>> {
    match target {
        "argenprop" => Some(Box::new(ArgenpropCrawler::new(fetcher))),
        _ => None,
    }
}
