//! CSV checkpoints, final export, and the run summary.
//!
//! Exports are best-effort side outputs: failures are logged by the caller
//! and never affect the crawl.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::models::{VehicleRecord, PRICE_UNKNOWN};

const COLUMNS: &[&str] = &[
    "listing_id",
    "page_number",
    "manufacturer",
    "model",
    "trim",
    "year",
    "mileage",
    "fuel",
    "location",
    "price",
    "price_value",
    "price_unit",
    "image_url",
    "badges",
    "performance_record",
    "diagnosis",
    "ad_text",
    "detail_url",
    "car_number",
    "detailed_year",
    "detailed_mileage",
    "engine_displacement",
    "detailed_fuel_type",
    "transmission",
    "car_type",
    "color",
    "detailed_location",
    "seating_capacity",
    "import_type",
    "seizure_mortgage",
    "view_count",
    "favorite_count",
    "extra",
    "crawled_at",
];

/// Writes checkpoints and the final export for one run.
pub struct CsvExporter {
    data_dir: PathBuf,
    site: String,
}

impl CsvExporter {
    pub fn new(data_dir: impl Into<PathBuf>, site: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            site: site.into(),
        }
    }

    /// Partial per-page checkpoint after `count` retained records.
    pub fn checkpoint(
        &self,
        page: u32,
        count: usize,
        records: &[VehicleRecord],
    ) -> anyhow::Result<PathBuf> {
        let filename = self
            .data_dir
            .join(format!("{}_checkpoint_page{}_{}.csv", self.site, page, count));
        self.write_csv(&filename, records)?;
        info!(
            "Checkpoint saved: {} records through page {}",
            records.len(),
            page
        );
        Ok(filename)
    }

    /// Final combined export with a timestamped filename.
    pub fn export_all(&self, records: &[VehicleRecord]) -> anyhow::Result<PathBuf> {
        let filename = self.data_dir.join(format!(
            "{}_all_{}.csv",
            self.site,
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        self.write_csv(&filename, records)?;
        info!(
            "Exported {} records to {}",
            records.len(),
            filename.display()
        );
        Ok(filename)
    }

    fn write_csv(&self, path: &Path, records: &[VehicleRecord]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(COLUMNS)?;
        for record in records {
            writer.write_record(csv_row(record))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn csv_row(r: &VehicleRecord) -> Vec<String> {
    let opt = |f: &Option<String>| f.clone().unwrap_or_default();
    let d = &r.detail;
    vec![
        r.listing_id.clone(),
        r.page_number.to_string(),
        opt(&r.manufacturer),
        opt(&r.model),
        opt(&r.trim),
        opt(&r.year),
        opt(&r.mileage),
        opt(&r.fuel),
        opt(&r.location),
        r.price.clone(),
        r.price_value.clone(),
        r.price_unit.clone(),
        opt(&r.image_url),
        r.badges.join(", "),
        r.has_inspection_record.to_string(),
        r.has_diagnosis.to_string(),
        opt(&r.ad_text),
        r.detail_url.clone(),
        opt(&d.car_number),
        opt(&d.detailed_year),
        opt(&d.detailed_mileage),
        opt(&d.engine_displacement),
        opt(&d.detailed_fuel_type),
        opt(&d.transmission),
        opt(&d.car_type),
        opt(&d.color),
        opt(&d.detailed_location),
        opt(&d.seating_capacity),
        opt(&d.import_type),
        opt(&d.seizure_mortgage),
        opt(&d.view_count),
        opt(&d.favorite_count),
        if d.extra.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&d.extra).unwrap_or_default()
        },
        r.crawled_at.to_rfc3339(),
    ]
}

/// Aggregates logged at the end of a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    pub by_manufacturer: BTreeMap<String, usize>,
    pub by_fuel: BTreeMap<String, usize>,
    pub by_location: BTreeMap<String, usize>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub price_mean: Option<f64>,
    pub price_median: Option<f64>,
}

/// Summarize a run's records.
pub fn summarize(records: &[VehicleRecord]) -> RunSummary {
    let mut summary = RunSummary {
        total: records.len(),
        ..Default::default()
    };

    let mut prices: Vec<f64> = Vec::new();
    for record in records {
        for (field, map) in [
            (&record.manufacturer, &mut summary.by_manufacturer),
            (&record.fuel, &mut summary.by_fuel),
            (&record.location, &mut summary.by_location),
        ] {
            if let Some(value) = field {
                *map.entry(value.clone()).or_default() += 1;
            }
        }
        if record.price_value != PRICE_UNKNOWN {
            if let Ok(price) = record.price_value.replace(',', "").parse::<f64>() {
                prices.push(price);
            }
        }
    }

    if !prices.is_empty() {
        prices.sort_by(|a, b| a.total_cmp(b));
        summary.price_min = prices.first().copied();
        summary.price_max = prices.last().copied();
        summary.price_mean = Some(prices.iter().sum::<f64>() / prices.len() as f64);
        summary.price_median = Some(prices[prices.len() / 2]);
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::DetailSpec;

    fn record(id: &str, manufacturer: &str, price: &str) -> VehicleRecord {
        VehicleRecord {
            listing_id: id.to_string(),
            row_index: None,
            page_number: 1,
            manufacturer: Some(manufacturer.to_string()),
            model: None,
            trim: None,
            year: None,
            mileage: None,
            fuel: Some("가솔린".to_string()),
            location: None,
            price: format!("{price}만원"),
            price_value: price.to_string(),
            price_unit: "만원".to_string(),
            image_url: None,
            badges: vec![],
            has_inspection_record: false,
            has_diagnosis: false,
            ad_text: None,
            detail_url: format!("https://example.com/{id}"),
            crawled_at: Utc::now(),
            detail: DetailSpec::default(),
        }
    }

    #[test]
    fn export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path(), "encar");
        let records = vec![record("1", "현대", "1,000"), record("2", "기아", "2,000")];

        let path = exporter.export_all(&records).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("listing_id,page_number"));
        assert_eq!(lines.count(), 2);
        assert!(text.contains("현대"));
    }

    #[test]
    fn checkpoint_filename_carries_page_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(dir.path(), "encar");
        let path = exporter.checkpoint(4, 5, &[record("1", "현대", "900")]).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("checkpoint_page4_5"));
    }

    #[test]
    fn summary_counts_and_price_stats() {
        let records = vec![
            record("1", "현대", "1,000"),
            record("2", "현대", "3,000"),
            record("3", "기아", crate::models::PRICE_UNKNOWN),
        ];
        let summary = summarize(&records);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_manufacturer["현대"], 2);
        assert_eq!(summary.by_fuel["가솔린"], 3);
        assert_eq!(summary.price_min, Some(1000.0));
        assert_eq!(summary.price_max, Some(3000.0));
        assert_eq!(summary.price_mean, Some(2000.0));
    }
}
