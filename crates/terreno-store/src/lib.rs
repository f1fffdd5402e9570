//! Persisted-store collaborator: Postgres-backed listing storage plus an
//! in-memory implementation for tests and offline runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use terreno_core::StoredListing;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "terreno-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("materializing schema for table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("querying existing links: {0}")]
    Query(#[source] sqlx::Error),
    #[error("inserting chunk of {rows} rows: {source}")]
    Insert {
        rows: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("injected failure on chunk {chunk_index}")]
    Injected { chunk_index: usize },
}

/// Read/write handle over the persisted listings relation.
///
/// `existing_links` is the single set-membership query external dedup relies
/// on; `insert_chunk` must be atomic per call so a failed chunk never leaves
/// a partial chunk behind.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Create the target relation if it does not exist yet.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// All `link` values currently persisted.
    async fn existing_links(&self) -> Result<HashSet<String>, StoreError>;

    /// Insert one ordered chunk of rows inside a single transaction.
    async fn insert_chunk(&self, chunk: &[StoredListing]) -> Result<(), StoreError>;
}

/// PostgreSQL-backed store. The table name comes from configuration, so SQL
/// is assembled with the name inlined; only values are bound.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
    table: String,
}

impl PgListingStore {
    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self {
            pool,
            table: table.into(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                address TEXT,
                price DOUBLE PRECISION NOT NULL,
                currency TEXT NOT NULL,
                area TEXT,
                link TEXT NOT NULL UNIQUE,
                lat DOUBLE PRECISION,
                lon DOUBLE PRECISION
            )",
            self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Schema {
                table: self.table.clone(),
                source,
            })?;
        debug!(table = %self.table, "schema ensured");
        Ok(())
    }

    async fn existing_links(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(&format!("SELECT link FROM {}", self.table))
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        let mut links = HashSet::with_capacity(rows.len());
        for row in rows {
            links.insert(row.try_get::<String, _>("link").map_err(StoreError::Query)?);
        }
        debug!(count = links.len(), "fetched existing links");
        Ok(links)
    }

    async fn insert_chunk(&self, chunk: &[StoredListing]) -> Result<(), StoreError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let insert_err = |source| StoreError::Insert {
            rows: chunk.len(),
            source,
        };

        let mut tx = self.pool.begin().await.map_err(insert_err)?;
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} (id, created_at, title, description, address, price, currency, area, link, lat, lon) ",
            self.table
        ));
        builder.push_values(chunk.iter(), |mut b, row| {
            b.push_bind(row.id)
                .push_bind(row.created_at)
                .push_bind(&row.title)
                .push_bind(&row.description)
                .push_bind(&row.address)
                .push_bind(row.price)
                .push_bind(row.currency.as_str())
                .push_bind(&row.area)
                .push_bind(&row.link)
                .push_bind(row.lat)
                .push_bind(row.lon);
        });
        builder.build().execute(&mut *tx).await.map_err(insert_err)?;
        tx.commit().await.map_err(insert_err)?;

        info!(rows = chunk.len(), table = %self.table, "chunk committed");
        Ok(())
    }
}

/// In-memory store used by the pipeline tests and fixture-driven dev runs.
///
/// Records every insert call size so tests can assert chunking behavior, and
/// can be armed to fail on a given chunk index to exercise the partial-load
/// path.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: RwLock<Vec<StoredListing>>,
    insert_calls: RwLock<Vec<usize>>,
    schema_calls: AtomicUsize,
    fail_on_chunk: Option<usize>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `insert_chunk` fails on the zero-based `chunk_index`-th call.
    pub fn failing_on_chunk(chunk_index: usize) -> Self {
        Self {
            fail_on_chunk: Some(chunk_index),
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<StoredListing> {
        self.rows.read().expect("rows lock poisoned").clone()
    }

    /// Sizes of every `insert_chunk` call, in order.
    pub fn insert_calls(&self) -> Vec<usize> {
        self.insert_calls
            .read()
            .expect("insert_calls lock poisoned")
            .clone()
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn existing_links(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .rows
            .read()
            .expect("rows lock poisoned")
            .iter()
            .map(|row| row.link.clone())
            .collect())
    }

    async fn insert_chunk(&self, chunk: &[StoredListing]) -> Result<(), StoreError> {
        let call_index = {
            let mut calls = self.insert_calls.write().expect("insert_calls lock poisoned");
            calls.push(chunk.len());
            calls.len() - 1
        };
        if self.fail_on_chunk == Some(call_index) {
            return Err(StoreError::Injected {
                chunk_index: call_index,
            });
        }
        self.rows
            .write()
            .expect("rows lock poisoned")
            .extend_from_slice(chunk);
        Ok(())
    }
}
