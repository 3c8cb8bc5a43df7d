use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Parsed listing fields, kept ordered so their encoding is canonical.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Auction site a listing comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Ebay,
    Local,
    Other,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Ebay => "ebay",
            Source::Local => "local",
            Source::Other => "other",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ebay" => Ok(Source::Ebay),
            "local" => Ok(Source::Local),
            "other" => Ok(Source::Other),
            _ => Err(format!("Unknown source: {s}")),
        }
    }
}

/// Identity of a listing: unique by `(source, external_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub source: Source,
    pub external_id: String,
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// Immutable reference to an auction listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingRef {
    pub source: Source,
    pub external_id: String,
    pub url: String,
}

impl ListingRef {
    pub fn new(source: Source, external_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source,
            external_id: external_id.into(),
            url: url.into(),
        }
    }

    pub fn key(&self) -> ListingKey {
        ListingKey {
            source: self.source,
            external_id: self.external_id.clone(),
        }
    }
}

/// Point-in-time parsed state of a listing, produced by one successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub listing: ListingRef,
    pub fetched_at: DateTime<Utc>,
    /// SHA-256 of the canonical field encoding, not of the raw page.
    pub content_hash: String,
    pub fields: Fields,
    /// Size of the raw response body in bytes.
    pub raw_size: usize,
}

impl ListingSnapshot {
    pub fn new(listing: ListingRef, fields: Fields, raw_size: usize) -> Self {
        Self::fetched(listing, fields, raw_size, Utc::now())
    }

    pub fn fetched(
        listing: ListingRef,
        fields: Fields,
        raw_size: usize,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let content_hash = hash_fields(&fields);
        Self {
            listing,
            fetched_at,
            content_hash,
            fields,
            raw_size,
        }
    }

    /// Numeric field lookup; accepts JSON numbers and numeric strings.
    pub fn number(&self, name: &str) -> Option<f64> {
        field_number(&self.fields, name)
    }
}

/// Computed profit estimate for one snapshot of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub id: Uuid,
    pub listing: ListingRef,
    /// Content hash of the snapshot this record was derived from.
    pub snapshot_hash: String,
    /// Fetch time of that snapshot. A stored record is only replaced by one
    /// derived from a snapshot fetched no earlier.
    pub snapshot_fetched_at: DateTime<Utc>,
    pub predicted_value: f64,
    pub listing_cost: f64,
    pub fees: f64,
    pub shipping_cost: f64,
    /// `listing_cost + fees + shipping_cost`
    pub total_cost: f64,
    pub margin: f64,
    pub computed_at: DateTime<Utc>,
}

/// Numeric field lookup shared by the snapshot and the scorers.
pub fn field_number(fields: &Fields, name: &str) -> Option<f64> {
    match fields.get(name)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash of the canonical (key-ordered, compact JSON) encoding of `fields`.
pub fn hash_fields(fields: &Fields) -> String {
    // BTreeMap iteration is ordered, and serde_json writes maps in iteration order.
    let canonical = serde_json::to_string(fields).unwrap_or_default();
    compute_hash(&canonical)
}
