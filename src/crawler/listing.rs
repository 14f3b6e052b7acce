//! Listing extraction from search-results pages.
//!
//! Works on an HTML snapshot of the rendered page, so it stays pure and
//! testable. Optional fields degrade to empty values; a row missing its
//! identity or detail link is dropped; a row whose id already appears in
//! the accumulated records is skipped.

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::models::{contains_listing, DetailSpec, VehicleRecord, PRICE_UNKNOWN};
use crate::site::{IdentityRule, SiteProfile};

/// Result of extracting one page of listings.
#[derive(Debug, Default)]
pub struct ListingExtraction {
    /// Raw row count before dedup/validity filtering.
    pub total_rows: usize,
    /// Records-in-progress (base fields only).
    pub records: Vec<VehicleRecord>,
    pub skipped_duplicates: usize,
    pub skipped_invalid: usize,
}

/// Extract listing candidates from a rendered search-results page.
///
/// `seen` is the run accumulator, read-only, used for duplicate lookup.
pub fn extract_listings(
    html: &str,
    profile: &SiteProfile,
    page_number: u32,
    seen: &[VehicleRecord],
) -> ListingExtraction {
    let mut out = ListingExtraction::default();

    let row_selector = match Selector::parse(&profile.listing.row) {
        Ok(s) => s,
        Err(_) => {
            warn!("Failed to parse row selector: {}", profile.listing.row);
            return out;
        }
    };

    let document = Html::parse_document(html);
    for row in document.select(&row_selector) {
        out.total_rows += 1;
        match extract_row(row, profile, page_number) {
            Some(record) => {
                if contains_listing(seen, &record.listing_id)
                    || out
                        .records
                        .iter()
                        .any(|r| r.listing_id == record.listing_id)
                {
                    debug!("Listing {} already processed, skipping", record.listing_id);
                    out.skipped_duplicates += 1;
                } else {
                    out.records.push(record);
                }
            }
            None => out.skipped_invalid += 1,
        }
    }

    out
}

/// Extract one row; `None` drops the row (identity or detail link missing).
fn extract_row(row: ElementRef<'_>, profile: &SiteProfile, page_number: u32) -> Option<VehicleRecord> {
    let listing = &profile.listing;

    let detail_url = first_attr(row, &listing.detail_link, "href").map(|href| {
        match &listing.detail_url_base {
            Some(base) if !href.starts_with("http") => format!("{base}{href}"),
            _ => href,
        }
    })?;

    let listing_id = match &listing.identity {
        IdentityRule::Attribute {
            attribute,
            delimiter,
        } => {
            let raw = row.value().attr(attribute.as_str())?;
            match delimiter {
                Some(d) => raw.split(d.as_str()).next().unwrap_or(raw).to_string(),
                None => raw.to_string(),
            }
        }
        IdentityRule::DetailUrl { from_detail_url } => {
            if !from_detail_url {
                return None;
            }
            detail_url.clone()
        }
    };
    if listing_id.is_empty() {
        return None;
    }

    let (price, price_value, price_unit) = extract_price(row, profile);

    Some(VehicleRecord {
        listing_id,
        row_index: listing
            .index_attribute
            .as_deref()
            .and_then(|attr| row.value().attr(attr))
            .map(str::to_string),
        page_number,
        manufacturer: first_text(row, listing.manufacturer.as_deref()),
        model: first_text(row, listing.model.as_deref()),
        trim: first_text(row, listing.trim.as_deref()),
        year: first_text(row, listing.year.as_deref()),
        mileage: first_text(row, listing.mileage.as_deref()),
        fuel: first_text(row, listing.fuel.as_deref()),
        location: first_text(row, listing.location.as_deref()),
        price,
        price_value,
        price_unit,
        image_url: listing
            .image
            .as_deref()
            .and_then(|sel| first_attr(row, sel, "src")),
        badges: all_texts(row, listing.badges.as_deref()),
        has_inspection_record: has_match(row, listing.inspection.as_deref()),
        has_diagnosis: has_match(row, listing.diagnosis.as_deref()),
        ad_text: first_text(row, listing.ad_text.as_deref()),
        detail_url,
        crawled_at: Utc::now(),
        detail: DetailSpec::default(),
    })
}

/// Price with value/unit split and the primary→fallback selector chain.
fn extract_price(row: ElementRef<'_>, profile: &SiteProfile) -> (String, String, String) {
    let listing = &profile.listing;
    for sel in [listing.price_primary.as_deref(), listing.price_fallback.as_deref()]
        .into_iter()
        .flatten()
    {
        if let Some(cell) = select_first(row, sel) {
            let full = element_text(cell);
            if full.is_empty() {
                continue;
            }
            let value = listing
                .price_value
                .as_deref()
                .and_then(|vs| select_first(cell, vs))
                .map(element_text)
                .unwrap_or_else(|| full.clone());
            let unit = full.replace(value.as_str(), "").trim().to_string();
            let combined = format!("{value}{unit}");
            return (combined, value, unit);
        }
    }
    (
        PRICE_UNKNOWN.to_string(),
        PRICE_UNKNOWN.to_string(),
        String::new(),
    )
}

fn select_first<'a>(scope: ElementRef<'a>, selector: &str) -> Option<ElementRef<'a>> {
    let parsed = Selector::parse(selector).ok()?;
    scope.select(&parsed).next()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn first_text(scope: ElementRef<'_>, selector: Option<&str>) -> Option<String> {
    let element = select_first(scope, selector?)?;
    let text = element_text(element);
    (!text.is_empty()).then_some(text)
}

fn first_attr(scope: ElementRef<'_>, selector: &str, name: &str) -> Option<String> {
    select_first(scope, selector)?
        .value()
        .attr(name)
        .map(str::to_string)
}

fn all_texts(scope: ElementRef<'_>, selector: Option<&str>) -> Vec<String> {
    let Some(selector) = selector else {
        return Vec::new();
    };
    let Ok(parsed) = Selector::parse(selector) else {
        return Vec::new();
    };
    scope
        .select(&parsed)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect()
}

fn has_match(scope: ElementRef<'_>, selector: Option<&str>) -> bool {
    selector
        .and_then(|sel| select_first(scope, sel))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_html(id: &str, with_price_primary: bool) -> String {
        let price = if with_price_primary {
            r#"<td class="prc_hs"><strong>1,234</strong>만원</td>"#
        } else {
            r#"<td class="prc"><strong>987</strong>만원</td>"#
        };
        format!(
            r#"<tr data-index="3" data-impression="{id}|extra|fields">
                <td class="img">
                    <img class="thumb" src="https://img.example.com/{id}.jpg">
                    <span class="service_badge_list"><em>진단</em><em>믿고</em></span>
                    <div class="box_advertise"><span class="desc_advertise">광고</span></div>
                </td>
                <td class="inf">
                    <a href="https://example.com/detail/{id}"></a>
                    <span class="cls"><strong>현대</strong><em>그랜저</em></span>
                    <span class="dtl"><strong>그랜저 IG 2.4</strong></span>
                    <span class="detail">
                        <span class="yer">20년 3월</span>
                        <span class="km">41,000km</span>
                        <span class="fue">가솔린</span>
                        <span class="loc">서울</span>
                        <span class="ins"></span>
                    </span>
                </td>
                {price}
            </tr>"#
        )
    }

    fn page_html(rows: &[String]) -> String {
        // The results list is a tbody carrying the container id, as on the
        // live site; the HTML parser would hoist a bare <tr> out of <table>.
        format!(
            r#"<html><body><table><tbody id="sr_normal">{}</tbody></table></body></html>"#,
            rows.join("\n")
        )
    }

    fn profile() -> SiteProfile {
        SiteProfile::builtin("encar").unwrap()
    }

    #[test]
    fn extracts_base_fields_from_a_row() {
        let html = page_html(&[row_html("100", true)]);
        let extraction = extract_listings(&html, &profile(), 7, &[]);

        assert_eq!(extraction.total_rows, 1);
        assert_eq!(extraction.records.len(), 1);
        let rec = &extraction.records[0];
        assert_eq!(rec.listing_id, "100");
        assert_eq!(rec.row_index.as_deref(), Some("3"));
        assert_eq!(rec.page_number, 7);
        assert_eq!(rec.manufacturer.as_deref(), Some("현대"));
        assert_eq!(rec.model.as_deref(), Some("그랜저"));
        assert_eq!(rec.trim.as_deref(), Some("그랜저 IG 2.4"));
        assert_eq!(rec.year.as_deref(), Some("20년 3월"));
        assert_eq!(rec.badges, vec!["진단", "믿고"]);
        assert!(rec.has_inspection_record);
        assert!(!rec.has_diagnosis);
        assert_eq!(rec.ad_text.as_deref(), Some("광고"));
        assert_eq!(rec.detail_url, "https://example.com/detail/100");
        assert_eq!(rec.price_value, "1,234");
        assert_eq!(rec.price_unit, "만원");
        assert_eq!(rec.price, "1,234만원");
    }

    #[test]
    fn price_falls_back_to_secondary_selector() {
        let html = page_html(&[row_html("200", false)]);
        let extraction = extract_listings(&html, &profile(), 1, &[]);
        assert_eq!(extraction.records[0].price_value, "987");
    }

    #[test]
    fn price_defaults_when_no_cell_matches() {
        let html = page_html(&[row_html("300", true).replace("prc_hs", "nope")]);
        let extraction = extract_listings(&html, &profile(), 1, &[]);
        assert_eq!(extraction.records[0].price, PRICE_UNKNOWN);
        assert_eq!(extraction.records[0].price_unit, "");
    }

    #[test]
    fn duplicate_ids_are_skipped() {
        // Page with 3 rows, one id already accumulated: exactly 2 new records.
        let html = page_html(&[row_html("1", true), row_html("2", true), row_html("3", true)]);
        let accumulated = extract_listings(&page_html(&[row_html("2", true)]), &profile(), 1, &[]);

        let extraction = extract_listings(&html, &profile(), 2, &accumulated.records);
        assert_eq!(extraction.total_rows, 3);
        assert_eq!(extraction.records.len(), 2);
        assert_eq!(extraction.skipped_duplicates, 1);
        let ids: Vec<_> = extraction.records.iter().map(|r| r.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn duplicates_within_one_page_are_skipped() {
        let html = page_html(&[row_html("9", true), row_html("9", true)]);
        let extraction = extract_listings(&html, &profile(), 1, &[]);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.skipped_duplicates, 1);
    }

    #[test]
    fn missing_identity_drops_only_that_row() {
        let broken = row_html("5", true).replace("data-impression", "data-other");
        let html = page_html(&[broken, row_html("6", true)]);
        let extraction = extract_listings(&html, &profile(), 1, &[]);
        assert_eq!(extraction.total_rows, 2);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.skipped_invalid, 1);
        assert_eq!(extraction.records[0].listing_id, "6");
    }

    #[test]
    fn missing_optional_fields_degrade_to_empty() {
        let bare =
            r#"<tr data-impression="77|x"><td class="inf"><a href="/detail/77"></a></td></tr>"#
                .to_string();
        let html = page_html(&[bare]);
        let extraction = extract_listings(&html, &profile(), 1, &[]);
        let rec = &extraction.records[0];
        assert_eq!(rec.listing_id, "77");
        assert!(rec.manufacturer.is_none());
        assert!(rec.badges.is_empty());
        assert_eq!(rec.price, PRICE_UNKNOWN);
    }
}
