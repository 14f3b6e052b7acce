//! End-to-end pipeline tests over rendered page snapshots: extraction,
//! detail merge, index document shape, and CSV export, using the shipped
//! site profile.

use carhive::crawler::{extract_listings, parse_detail_rows};
use carhive::export::{summarize, CsvExporter};
use carhive::models::DetailSpec;
use carhive::site::SiteProfile;

fn listing_row(id: &str, manufacturer: &str, price: &str) -> String {
    format!(
        r#"<tr data-index="1" data-impression="{id}|imp|data">
            <td class="img"><img class="thumb" src="https://img.example.com/{id}.jpg"></td>
            <td class="inf">
                <a href="https://example.com/cars/detail/{id}"></a>
                <span class="cls"><strong>{manufacturer}</strong><em>쏘나타</em></span>
                <span class="dtl"><strong>쏘나타 DN8 2.0</strong></span>
                <span class="detail">
                    <span class="yer">21년 7월</span>
                    <span class="km">30,000km</span>
                    <span class="fue">가솔린</span>
                    <span class="loc">인천</span>
                </span>
            </td>
            <td class="prc_hs"><strong>{price}</strong>만원</td>
        </tr>"#
    )
}

fn listing_html(rows: &[String]) -> String {
    format!(
        r#"<html><body><table><tbody id="sr_normal">{}</tbody></table></body></html>"#,
        rows.join("")
    )
}

fn detail_panel(rows: &[(&str, &str)]) -> String {
    let items: String = rows
        .iter()
        .map(|(k, v)| {
            format!(
                r#"<li><span class="DetailSpec_tit__BRQb+">{k}</span><span class="DetailSpec_txt__NGapF">{v}</span></li>"#
            )
        })
        .collect();
    format!(
        r#"<html><body><div class="BottomSheet-module_bottom_sheet__LeljN"><ul class="DetailSpec_list_default__Gx+ZA">{items}</ul></div></body></html>"#
    )
}

#[test]
fn listing_to_index_document_roundtrip() {
    let profile = SiteProfile::builtin("encar").unwrap();
    let html = listing_html(&[listing_row("31415", "현대", "2,150")]);

    let extraction = extract_listings(&html, &profile, 3, &[]);
    assert_eq!(extraction.records.len(), 1);
    let mut record = extraction.records.into_iter().next().unwrap();

    let mut detail = DetailSpec::default();
    parse_detail_rows(
        &detail_panel(&[
            ("차량번호", "12가3456"),
            ("변속기", "오토"),
            ("조회수 도움말아이콘", "987"),
            ("특이옵션", "선루프"),
        ]),
        &profile,
        &mut detail,
    );
    record.merge_detail(detail);

    let doc = record.to_index_doc();
    assert_eq!(doc["car_id"], "31415");
    assert_eq!(doc["manufacturer"], "현대");
    assert_eq!(doc["detailed_model"], "쏘나타 DN8 2.0");
    assert_eq!(doc["price_value"], "2,150");
    assert_eq!(doc["page_number"], 3);
    assert_eq!(doc["car_number"], "12가3456");
    assert_eq!(doc["transmission"], "오토");
    // Affixed label collapsed to the base label before mapping.
    assert_eq!(doc["view_count"], "987");
    // Unmapped label passed through verbatim.
    assert_eq!(doc["특이옵션"], "선루프");
}

#[test]
fn dedup_holds_across_pages() {
    let profile = SiteProfile::builtin("encar").unwrap();
    let page1 = listing_html(&[
        listing_row("1", "현대", "1,000"),
        listing_row("2", "기아", "2,000"),
    ]);
    let page2 = listing_html(&[
        listing_row("2", "기아", "2,000"),
        listing_row("3", "제네시스", "5,000"),
    ]);

    let mut accumulator = Vec::new();
    for (page_number, html) in [(1u32, page1), (2u32, page2)] {
        let extraction = extract_listings(&html, &profile, page_number, &accumulator);
        accumulator.extend(extraction.records);
    }

    let mut ids: Vec<_> = accumulator.iter().map(|r| r.listing_id.clone()).collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(total, ids.len());
    assert_eq!(total, 3);
}

#[test]
fn export_and_summary_cover_accumulated_records() {
    let profile = SiteProfile::builtin("encar").unwrap();
    let html = listing_html(&[
        listing_row("10", "현대", "1,000"),
        listing_row("11", "현대", "3,000"),
    ]);
    let records = extract_listings(&html, &profile, 1, &[]).records;

    let dir = tempfile::tempdir().unwrap();
    let exporter = CsvExporter::new(dir.path(), "encar");
    let path = exporter.export_all(&records).unwrap();
    let text = std::fs::read_to_string(path).unwrap();
    assert_eq!(text.lines().count(), 3);
    assert!(text.lines().next().unwrap().contains("listing_id"));

    let summary = summarize(&records);
    assert_eq!(summary.total, 2);
    assert_eq!(summary.by_manufacturer["현대"], 2);
    assert_eq!(summary.price_mean, Some(2000.0));
}
