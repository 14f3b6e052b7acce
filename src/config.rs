//! Configuration for carhive.
//!
//! Settings load from an optional TOML file, with defaults that match the
//! behavior of the production crawl. Credentials come from the environment
//! (or `.env`) via the CLI layer, never from the settings file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::crawler::{BackoffConfig, DelayPolicy};

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory for CSV checkpoints and exports.
    pub data_dir: PathBuf,
    /// Directory for diagnostic screenshots.
    pub screenshots_dir: PathBuf,
    pub crawl: CrawlSettings,
    pub delays: DelayPolicy,
    pub backoff: BackoffConfig,
    pub index: IndexSettings,
}

/// Crawl bounds and retry budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlSettings {
    /// First page to crawl.
    pub start_page: u32,
    /// Maximum number of pages per run.
    pub max_pages: u32,
    /// Whole-run retry budget.
    pub run_retries: u32,
    /// Detail-fetch attempt budget.
    pub detail_retries: u32,
    /// Same-page replay budget for navigation failures.
    pub page_retries: u32,
    /// Wall-clock bound for one run, in minutes (0 = unbounded).
    pub max_run_minutes: u64,
    /// Write a partial CSV checkpoint every N retained records.
    pub checkpoint_every: usize,
    /// Run the browser headless.
    pub headless: bool,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            start_page: 1,
            max_pages: 1500,
            run_retries: 3,
            detail_retries: 2,
            page_retries: 2,
            max_run_minutes: 0,
            checkpoint_every: 5,
            headless: true,
        }
    }
}

/// Search index connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Base URL of the OpenSearch-compatible endpoint.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Index name; defaults to `<site>_vehicles` when unset.
    pub index: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            index: None,
            timeout_secs: 30,
        }
    }
}

impl IndexSettings {
    /// Effective index name for a site profile.
    pub fn index_for(&self, site: &str) -> String {
        self.index
            .clone()
            .unwrap_or_else(|| format!("{site}_vehicles"))
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults when the file is absent.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            _ => Self::default(),
        };
        if settings.data_dir.as_os_str().is_empty() {
            settings.data_dir = PathBuf::from("data");
        }
        if settings.screenshots_dir.as_os_str().is_empty() {
            settings.screenshots_dir = PathBuf::from("screenshots");
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_budgets() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.crawl.max_pages, 1500);
        assert_eq!(settings.crawl.run_retries, 3);
        assert_eq!(settings.crawl.detail_retries, 2);
        assert_eq!(settings.crawl.checkpoint_every, 5);
        assert_eq!(settings.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn index_name_defaults_per_site() {
        let settings = Settings::default();
        assert_eq!(settings.index.index_for("encar"), "encar_vehicles");

        let named = IndexSettings {
            index: Some("cars".to_string()),
            ..Default::default()
        };
        assert_eq!(named.index_for("encar"), "cars");
    }

    #[test]
    fn partial_settings_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carhive.toml");
        std::fs::write(&path, "[crawl]\nmax_pages = 10\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.crawl.max_pages, 10);
        assert_eq!(settings.crawl.run_retries, 3);
    }
}
