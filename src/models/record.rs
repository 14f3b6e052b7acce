//! Listing record types.
//!
//! A `VehicleRecord` is the merged base+detail data for one listing. Base
//! fields come from the search-results row; the `DetailSpec` is filled in
//! from the detail page's specification panel. Identity is the site-assigned
//! listing id, and at most one record per id is retained per run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel used when a price cannot be located on the listing row.
pub const PRICE_UNKNOWN: &str = "정보없음";

/// Base listing data extracted from one search-results row, merged with
/// detail-page fields after the detail fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRecord {
    /// Site-assigned listing id (first `|`-segment of the impression attribute).
    pub listing_id: String,
    /// Row index attribute, when present.
    pub row_index: Option<String>,
    /// Search-results page this listing was found on.
    pub page_number: u32,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    /// Detailed model name shown under the model line.
    pub trim: Option<String>,
    pub year: Option<String>,
    pub mileage: Option<String>,
    pub fuel: Option<String>,
    pub location: Option<String>,
    /// Combined price string (value + unit), or [`PRICE_UNKNOWN`].
    pub price: String,
    pub price_value: String,
    pub price_unit: String,
    pub image_url: Option<String>,
    /// Service badge texts, in row order.
    pub badges: Vec<String>,
    /// Whether the row carries an inspection-record marker.
    pub has_inspection_record: bool,
    /// Whether the row carries a site-diagnosis marker.
    pub has_diagnosis: bool,
    /// Advertisement text attached to the row, when present.
    pub ad_text: Option<String>,
    /// Absolute URL of the listing's detail page.
    pub detail_url: String,
    pub crawled_at: DateTime<Utc>,
    /// Detail-page specification fields.
    pub detail: DetailSpec,
}

impl VehicleRecord {
    /// Merge detail-page fields into this record.
    pub fn merge_detail(&mut self, detail: DetailSpec) {
        self.detail = detail;
    }

    /// Flatten to a JSON document for the search index.
    ///
    /// Field names follow the index mapping; unmapped detail labels are
    /// carried through under their raw label.
    pub fn to_index_doc(&self) -> serde_json::Value {
        let mut doc = serde_json::json!({
            "car_id": self.listing_id,
            "index": self.row_index,
            "page_number": self.page_number,
            "manufacturer": self.manufacturer,
            "model": self.model,
            "detailed_model": self.trim,
            "year": self.year,
            "mileage": self.mileage,
            "fuel_type": self.fuel,
            "location": self.location,
            "price": self.price,
            "price_value": self.price_value,
            "price_unit": self.price_unit,
            "image_url": self.image_url,
            "badge": self.badges.join(", "),
            "performance_record": self.has_inspection_record,
            "diagnosis": self.has_diagnosis,
            "ad_info": self.ad_text,
            "detail_page_url": self.detail_url,
            "crawling_time": self.crawled_at.to_rfc3339(),
        });
        if let serde_json::Value::Object(map) = &mut doc {
            self.detail.fill_index_doc(map);
        }
        doc
    }
}

/// Detail-page specification fields.
///
/// The fixed fields correspond to the canonical field identifiers produced
/// by the label-normalization table; labels without a mapping land in
/// `extra` verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailSpec {
    pub car_number: Option<String>,
    pub detailed_year: Option<String>,
    pub detailed_mileage: Option<String>,
    pub engine_displacement: Option<String>,
    pub detailed_fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub car_type: Option<String>,
    pub color: Option<String>,
    pub detailed_location: Option<String>,
    pub seating_capacity: Option<String>,
    pub import_type: Option<String>,
    pub seizure_mortgage: Option<String>,
    pub view_count: Option<String>,
    pub favorite_count: Option<String>,
    /// Labels with no canonical mapping, passed through unchanged.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl DetailSpec {
    /// Store a value under a canonical field identifier.
    ///
    /// Unknown identifiers are kept in `extra` rather than dropped.
    pub fn set(&mut self, field: &str, value: String) {
        match field {
            "car_number" => self.car_number = Some(value),
            "detailed_year" => self.detailed_year = Some(value),
            "detailed_mileage" => self.detailed_mileage = Some(value),
            "engine_displacement" => self.engine_displacement = Some(value),
            "detailed_fuel_type" => self.detailed_fuel_type = Some(value),
            "transmission" => self.transmission = Some(value),
            "car_type" => self.car_type = Some(value),
            "color" => self.color = Some(value),
            "detailed_location" => self.detailed_location = Some(value),
            "seating_capacity" => self.seating_capacity = Some(value),
            "import_type" => self.import_type = Some(value),
            "seizure_mortgage" => self.seizure_mortgage = Some(value),
            "view_count" => self.view_count = Some(value),
            "favorite_count" => self.favorite_count = Some(value),
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
    }

    /// Number of populated fields, counting `extra` entries.
    pub fn len(&self) -> usize {
        let fixed = [
            &self.car_number,
            &self.detailed_year,
            &self.detailed_mileage,
            &self.engine_displacement,
            &self.detailed_fuel_type,
            &self.transmission,
            &self.car_type,
            &self.color,
            &self.detailed_location,
            &self.seating_capacity,
            &self.import_type,
            &self.seizure_mortgage,
            &self.view_count,
            &self.favorite_count,
        ]
        .iter()
        .filter(|f| f.is_some())
        .count();
        fixed + self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fill_index_doc(&self, doc: &mut serde_json::Map<String, serde_json::Value>) {
        let fields = [
            ("car_number", &self.car_number),
            ("detailed_year", &self.detailed_year),
            ("detailed_mileage", &self.detailed_mileage),
            ("engine_displacement", &self.engine_displacement),
            ("detailed_fuel_type", &self.detailed_fuel_type),
            ("transmission", &self.transmission),
            ("car_type", &self.car_type),
            ("color", &self.color),
            ("detailed_location", &self.detailed_location),
            ("seating_capacity", &self.seating_capacity),
            ("import_type", &self.import_type),
            ("seizure_mortgage", &self.seizure_mortgage),
            ("view_count", &self.view_count),
            ("favorite_count", &self.favorite_count),
        ];
        for (name, value) in fields {
            if let Some(v) = value {
                doc.insert(name.to_string(), serde_json::Value::String(v.clone()));
            }
        }
        for (label, value) in &self.extra {
            doc.insert(label.clone(), serde_json::Value::String(value.clone()));
        }
    }
}

/// Whether a listing id is already present in the accumulated records.
///
/// Linear scan by design: per-run volumes are small and the accumulator is
/// append-only, so anything fancier buys nothing.
pub fn contains_listing(records: &[VehicleRecord], listing_id: &str) -> bool {
    records.iter().any(|r| r.listing_id == listing_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> VehicleRecord {
        VehicleRecord {
            listing_id: id.to_string(),
            row_index: None,
            page_number: 1,
            manufacturer: Some("현대".to_string()),
            model: None,
            trim: None,
            year: None,
            mileage: None,
            fuel: None,
            location: None,
            price: PRICE_UNKNOWN.to_string(),
            price_value: PRICE_UNKNOWN.to_string(),
            price_unit: String::new(),
            image_url: None,
            badges: vec![],
            has_inspection_record: false,
            has_diagnosis: false,
            ad_text: None,
            detail_url: "https://example.com/detail/1".to_string(),
            crawled_at: Utc::now(),
            detail: DetailSpec::default(),
        }
    }

    #[test]
    fn detail_spec_set_known_and_unknown_fields() {
        let mut spec = DetailSpec::default();
        spec.set("transmission", "오토".to_string());
        spec.set("보증여부", "보증".to_string());

        assert_eq!(spec.transmission.as_deref(), Some("오토"));
        assert_eq!(spec.extra.get("보증여부").map(String::as_str), Some("보증"));
        assert_eq!(spec.len(), 2);
    }

    #[test]
    fn contains_listing_scans_by_id() {
        let records = vec![record("111"), record("222")];
        assert!(contains_listing(&records, "111"));
        assert!(!contains_listing(&records, "333"));
    }

    #[test]
    fn index_doc_carries_detail_and_extra_fields() {
        let mut rec = record("42");
        let mut spec = DetailSpec::default();
        spec.set("color", "흰색".to_string());
        spec.set("보증여부", "보증".to_string());
        rec.merge_detail(spec);

        let doc = rec.to_index_doc();
        assert_eq!(doc["car_id"], "42");
        assert_eq!(doc["color"], "흰색");
        assert_eq!(doc["보증여부"], "보증");
        assert_eq!(doc["performance_record"], false);
    }
}
