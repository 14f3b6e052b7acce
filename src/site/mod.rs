//! Site profiles: selector tables, label maps, and wait/robot markers.
//!
//! A profile is pure data (TOML), so a new target site means a new profile
//! file, not new code. Two profiles ship embedded: the main car portal
//! (`encar`) and the secondary marketplace (`carku`).

use std::collections::BTreeMap;
use std::path::Path;

use scraper::Selector;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating a site profile.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("unknown built-in site profile: {0}")]
    UnknownSite(String),

    #[error("failed to read profile {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid selector {selector:?} in profile {profile}")]
    InvalidSelector { profile: String, selector: String },

    #[error("listing URL template for {0} is missing the {{page}} placeholder")]
    MissingPagePlaceholder(String),
}

/// Selector table and policies for one target site.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteProfile {
    pub name: String,
    /// Listing URL template with a `{page}` placeholder.
    pub listing_url: String,
    pub listing: ListingSelectors,
    pub detail: DetailSelectors,
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub robot: RobotMarkers,
}

/// Selectors for one search-results row and its sub-fields.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingSelectors {
    /// Container that signals the results list has rendered.
    pub container: String,
    /// One row per listing.
    pub row: String,
    pub identity: IdentityRule,
    #[serde(default)]
    pub index_attribute: Option<String>,
    pub image: Option<String>,
    pub badges: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub trim: Option<String>,
    pub year: Option<String>,
    pub mileage: Option<String>,
    pub fuel: Option<String>,
    pub location: Option<String>,
    pub inspection: Option<String>,
    pub diagnosis: Option<String>,
    pub price_primary: Option<String>,
    pub price_fallback: Option<String>,
    pub price_value: Option<String>,
    pub detail_link: String,
    pub ad_text: Option<String>,
    /// Prefix for relative detail links.
    #[serde(default)]
    pub detail_url_base: Option<String>,
}

/// How the listing id is derived from a row.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdentityRule {
    /// Read an attribute and take the first segment before `delimiter`.
    Attribute {
        attribute: String,
        #[serde(default)]
        delimiter: Option<String>,
    },
    /// Fall back to the detail URL as the identity.
    DetailUrl { from_detail_url: bool },
}

/// Detail-page selectors and the label-normalization table.
#[derive(Debug, Clone, Deserialize)]
pub struct DetailSelectors {
    /// Primary content region to wait for after opening the detail view.
    pub content: String,
    /// Control that reveals the full specification panel, when the site has one.
    #[serde(default)]
    pub button: Option<String>,
    /// Panel that appears after activating the control.
    #[serde(default)]
    pub panel: Option<String>,
    pub rows: String,
    pub label: String,
    pub value: String,
    /// Labels containing one of these collapse to the marker itself
    /// (strips trailing info-icon affixes).
    #[serde(default)]
    pub label_collapse: Vec<String>,
    /// Raw page label → canonical field identifier. Unmapped labels pass
    /// through verbatim.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// How the walker reaches page n+1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceMode {
    /// Click pagination controls in-page (block jumps every `block_size`).
    Click,
    /// Re-derive the listing URL for the next page number.
    Url,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    pub mode: AdvanceMode,
    #[serde(default)]
    pub container: Option<String>,
    /// "Next block" control, used when the current page ends a block.
    #[serde(default)]
    pub next_block: Option<String>,
    /// Attribute carrying the target page number on pagination links.
    #[serde(default = "default_page_attribute")]
    pub page_attribute: String,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
}

fn default_page_attribute() -> String {
    "data-page".to_string()
}

fn default_block_size() -> u32 {
    10
}

/// Page-content markers for robot countermeasures and empty results.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RobotMarkers {
    /// Content keywords that indicate a countermeasure page.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Content markers that indicate a legitimately empty results page.
    #[serde(default)]
    pub empty_markers: Vec<String>,
}

impl SiteProfile {
    /// Load a built-in profile by name.
    pub fn builtin(name: &str) -> Result<Self, ProfileError> {
        let text = match name {
            "encar" => include_str!("../../profiles/encar.toml"),
            "carku" => include_str!("../../profiles/carku.toml"),
            other => return Err(ProfileError::UnknownSite(other.to_string())),
        };
        let profile: Self = toml::from_str(text)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load a profile from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let profile: Self = toml::from_str(&text)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Listing URL for a given page number.
    pub fn listing_url_for(&self, page: u32) -> String {
        self.listing_url.replace("{page}", &page.to_string())
    }

    /// Selector for the in-page link to a specific page number.
    pub fn page_link_selector(&self, page: u32) -> String {
        let container = self.pagination.container.as_deref().unwrap_or("");
        format!(
            "{} a[{}='{}']",
            container, self.pagination.page_attribute, page
        )
        .trim()
        .to_string()
    }

    /// Collapse known label affixes, then trim.
    pub fn normalize_label(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        for marker in &self.detail.label_collapse {
            if trimmed.contains(marker.as_str()) {
                return marker.clone();
            }
        }
        trimmed.to_string()
    }

    /// Map a normalized label through the label table; unmapped labels pass
    /// through unchanged.
    pub fn canonical_field<'a>(&'a self, label: &'a str) -> &'a str {
        self.detail
            .labels
            .get(label)
            .map(String::as_str)
            .unwrap_or(label)
    }

    /// Whether page content looks like a robot countermeasure.
    pub fn matches_robot_keyword(&self, html: &str) -> Option<&str> {
        let lower = html.to_lowercase();
        self.robot
            .keywords
            .iter()
            .find(|k| lower.contains(k.to_lowercase().as_str()))
            .map(String::as_str)
    }

    /// Whether page content marks a legitimately empty results page.
    pub fn matches_empty_marker(&self, html: &str) -> bool {
        self.robot.empty_markers.iter().any(|m| html.contains(m.as_str()))
    }

    /// Parse every configured selector once so bad profiles fail at load.
    fn validate(&self) -> Result<(), ProfileError> {
        if !self.listing_url.contains("{page}") {
            return Err(ProfileError::MissingPagePlaceholder(self.name.clone()));
        }
        for selector in self.all_selectors() {
            if Selector::parse(selector).is_err() {
                return Err(ProfileError::InvalidSelector {
                    profile: self.name.clone(),
                    selector: selector.to_string(),
                });
            }
        }
        Ok(())
    }

    fn all_selectors(&self) -> Vec<&str> {
        let l = &self.listing;
        let d = &self.detail;
        let mut out = vec![
            l.container.as_str(),
            l.row.as_str(),
            l.detail_link.as_str(),
            d.content.as_str(),
            d.rows.as_str(),
            d.label.as_str(),
            d.value.as_str(),
        ];
        let optional = [
            &l.image,
            &l.badges,
            &l.manufacturer,
            &l.model,
            &l.trim,
            &l.year,
            &l.mileage,
            &l.fuel,
            &l.location,
            &l.inspection,
            &l.diagnosis,
            &l.price_primary,
            &l.price_fallback,
            &l.price_value,
            &l.ad_text,
            &d.button,
            &d.panel,
            &self.pagination.container,
            &self.pagination.next_block,
        ];
        out.extend(optional.iter().filter_map(|s| s.as_deref()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_validate() {
        let encar = SiteProfile::builtin("encar").unwrap();
        assert_eq!(encar.name, "encar");
        assert_eq!(encar.pagination.mode, AdvanceMode::Click);

        let carku = SiteProfile::builtin("carku").unwrap();
        assert_eq!(carku.pagination.mode, AdvanceMode::Url);
    }

    #[test]
    fn unknown_builtin_is_an_error() {
        assert!(matches!(
            SiteProfile::builtin("nope"),
            Err(ProfileError::UnknownSite(_))
        ));
    }

    #[test]
    fn listing_url_substitutes_page() {
        let profile = SiteProfile::builtin("carku").unwrap();
        let url = profile.listing_url_for(7);
        assert!(url.contains("wCurPage=7"), "got {url}");
        assert!(!url.contains("{page}"));
    }

    #[test]
    fn label_collapse_strips_affixes() {
        let profile = SiteProfile::builtin("encar").unwrap();
        // Info-icon affix after the view-count label collapses to the base label.
        assert_eq!(profile.normalize_label("조회수 도움말"), "조회수");
        assert_eq!(profile.normalize_label(" 연식 "), "연식");
    }

    #[test]
    fn label_table_maps_and_passes_through() {
        let profile = SiteProfile::builtin("encar").unwrap();
        assert_eq!(profile.canonical_field("변속기"), "transmission");
        assert_eq!(profile.canonical_field("연식"), "detailed_year");
        // Unmapped labels pass through verbatim.
        assert_eq!(profile.canonical_field("보증여부"), "보증여부");
    }

    #[test]
    fn page_link_selector_scopes_to_container() {
        let profile = SiteProfile::builtin("encar").unwrap();
        assert_eq!(
            profile.page_link_selector(12),
            "#pagination a[data-page='12']"
        );
    }

    #[test]
    fn robot_keywords_match_case_insensitively() {
        let profile = SiteProfile::builtin("carku").unwrap();
        assert!(profile.matches_robot_keyword("<html>Access Denied</html>").is_some());
        assert!(profile.matches_robot_keyword("<html>정상 페이지</html>").is_none());
    }
}
