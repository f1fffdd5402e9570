//! Core domain model for land-listing ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "terreno-core";

/// Currency inferred from the markers present in a listing's price text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "ARS")]
    Ars,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Ars => "ARS",
        }
    }
}

/// One scraped ad exactly as the crawler produced it, before any validation.
///
/// Every field is optional text; the normalizer decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub lat: Option<String>,
    #[serde(default)]
    pub lon: Option<String>,
}

/// Canonical normalized listing, not yet persisted.
///
/// Only the normalizer constructs these, so a `Listing` always carries a
/// non-empty title, a parsed price, and an absolute link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub address: Option<String>,
    pub description: Option<String>,
    pub price: f64,
    pub currency: Currency,
    pub area: Option<String>,
    pub link: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl Listing {
    /// Composite key used for within-run deduplication, first occurrence wins.
    pub fn dedup_key(&self) -> (String, Option<String>, u64) {
        (self.title.clone(), self.address.clone(), self.price.to_bits())
    }
}

/// Persisted row shape. `id` and `created_at` are assigned exactly once at
/// load time and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub address: Option<String>,
    pub description: Option<String>,
    pub price: f64,
    pub currency: Currency,
    pub area: Option<String>,
    pub link: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

impl StoredListing {
    pub fn from_listing(listing: Listing, id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            title: listing.title,
            address: listing.address,
            description: listing.description,
            price: listing.price,
            currency: listing.currency,
            area: listing.area,
            link: listing.link,
            lat: listing.lat,
            lon: listing.lon,
        }
    }
}
