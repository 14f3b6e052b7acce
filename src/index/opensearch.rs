//! OpenSearch-compatible REST sink.
//!
//! Speaks the plain index API over HTTP: existence check, index creation
//! with mappings, per-document upsert, and a document count for status
//! output. The detailed-model field is full-text with a scripted
//! similarity that ignores IDF, so short model queries rank by term
//! frequency and length alone; everything else is exact-match keywords.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};

use super::{IndexError, IndexSink};
use crate::config::IndexSettings;
use crate::models::VehicleRecord;

/// REST client for one index.
pub struct OpenSearchSink {
    client: reqwest::Client,
    base_url: String,
    index: String,
    username: Option<String>,
    password: Option<String>,
}

impl OpenSearchSink {
    pub fn new(settings: &IndexSettings, index: String) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            index,
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        builder
    }

    /// Create the index with settings and mappings unless it already exists.
    pub async fn ensure_index(&self) -> Result<(), IndexError> {
        let head = self
            .request(reqwest::Method::HEAD, &format!("/{}", self.index))
            .send()
            .await?;
        if head.status().is_success() {
            debug!("Index {} already exists", self.index);
            return Ok(());
        }
        if head.status() != StatusCode::NOT_FOUND {
            return Err(IndexError::Api {
                status: head.status().as_u16(),
                body: head.text().await.unwrap_or_default(),
            });
        }

        let response = self
            .request(reqwest::Method::PUT, &format!("/{}", self.index))
            .json(&index_body())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IndexError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        info!("Created index: {}", self.index);
        Ok(())
    }

    /// Document count, for status output.
    pub async fn doc_count(&self) -> Result<u64, IndexError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/{}/_stats", self.index))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IndexError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let stats: serde_json::Value = response.json().await?;
        Ok(stats["indices"][&self.index]["total"]["docs"]["count"]
            .as_u64()
            .unwrap_or(0))
    }
}

#[async_trait]
impl IndexSink for OpenSearchSink {
    async fn upsert(&self, record: &VehicleRecord) -> Result<(), IndexError> {
        // Deterministic id: re-crawls overwrite instead of duplicating.
        let path = format!("/{}/_doc/{}?refresh=true", self.index, record.listing_id);
        let response = self
            .request(reqwest::Method::PUT, &path)
            .json(&record.to_index_doc())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IndexError::Api {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!("Indexed listing {}", record.listing_id);
        Ok(())
    }
}

/// Index settings and mappings.
fn index_body() -> serde_json::Value {
    json!({
        "settings": {
            "index": {
                "number_of_shards": 2,
                "number_of_replicas": 1
            },
            "similarity": {
                "scripted_no_idf": {
                    "type": "scripted",
                    "script": {
                        "source": "double tf = Math.sqrt(doc.freq); double norm = 1/Math.sqrt(doc.length); return query.boost * tf * norm;"
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "car_id": {"type": "keyword"},
                "index": {"type": "keyword"},
                "manufacturer": {"type": "keyword"},
                "model": {"type": "keyword"},
                "detailed_model": {
                    "type": "text",
                    "norms": "false",
                    "similarity": "scripted_no_idf"
                },
                "year": {"type": "keyword"},
                "mileage": {"type": "keyword"},
                "fuel_type": {"type": "keyword"},
                "location": {"type": "keyword"},
                "price": {"type": "keyword"},
                "price_value": {"type": "keyword"},
                "price_unit": {"type": "keyword"},
                "image_url": {"type": "keyword"},
                "badge": {"type": "keyword"},
                "performance_record": {"type": "boolean"},
                "diagnosis": {"type": "boolean"},
                "ad_info": {"type": "keyword"},
                "detail_page_url": {"type": "keyword"},
                "page_number": {"type": "integer"},
                "car_number": {"type": "keyword"},
                "detailed_year": {"type": "keyword"},
                "detailed_mileage": {"type": "keyword"},
                "engine_displacement": {"type": "keyword"},
                "detailed_fuel_type": {"type": "keyword"},
                "transmission": {"type": "keyword"},
                "car_type": {"type": "keyword"},
                "color": {"type": "keyword"},
                "detailed_location": {"type": "keyword"},
                "seating_capacity": {"type": "keyword"},
                "import_type": {"type": "keyword"},
                "seizure_mortgage": {"type": "keyword"},
                "view_count": {"type": "keyword"},
                "favorite_count": {"type": "keyword"},
                "crawling_time": {"type": "date"}
            }
        }
    })
}
