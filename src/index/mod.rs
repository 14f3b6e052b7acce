//! Search index sink.
//!
//! One document per listing, upserted as records complete. Indexing is a
//! side output: per-record failures are reported to the caller for
//! counting but never affect crawl control flow.

mod opensearch;

pub use opensearch::OpenSearchSink;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::VehicleRecord;

/// Errors from the index API.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("index API error ({status}): {body}")]
    Api { status: u16, body: String },
}

/// Document-oriented upsert target for completed records.
#[async_trait]
pub trait IndexSink: Send + Sync {
    /// Upsert one record; each call independently succeeds or fails.
    async fn upsert(&self, record: &VehicleRecord) -> Result<(), IndexError>;
}
