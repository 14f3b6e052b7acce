//! Scriptable mock session and page fixtures for crawler tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::browser::{ListingSession, NavOutcome, SessionError};
use crate::site::SiteProfile;

/// Shared counters the tests keep a handle on after the controller takes
/// ownership of the session.
#[derive(Debug, Default)]
pub struct MockLog {
    navigations: Mutex<Vec<u32>>,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub resets: AtomicUsize,
}

impl MockLog {
    pub fn navigations(&self) -> Vec<u32> {
        self.navigations.lock().expect("mock log poisoned").clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Relaxed)
    }
}

/// Scriptable [`ListingSession`] with per-operation failure queues.
pub struct MockSession {
    /// Page number → listing HTML.
    pub pages: HashMap<u32, String>,
    pub detail_html: String,
    /// Errors for upcoming `open_detail` calls.
    pub open_failures: VecDeque<SessionError>,
    /// Errors for upcoming `content` calls while the detail context is open.
    pub content_failures: VecDeque<SessionError>,
    /// Errors for upcoming `close_detail` calls.
    pub close_failures: VecDeque<SessionError>,
    /// Inject a native dialog when the link to this page is clicked.
    pub dialog_on_click_page: Option<u32>,
    pub valid: bool,
    /// Replace a page's HTML after the next reset (robot pages clearing up).
    pub page_after_reset: Option<(u32, String)>,
    dialogs: VecDeque<String>,
    current_listing_html: String,
    detail_open: bool,
    log: Arc<MockLog>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            detail_html: detail_html(&[]),
            open_failures: VecDeque::new(),
            content_failures: VecDeque::new(),
            close_failures: VecDeque::new(),
            dialog_on_click_page: None,
            valid: true,
            page_after_reset: None,
            dialogs: VecDeque::new(),
            current_listing_html: String::new(),
            detail_open: false,
            log: Arc::new(MockLog::default()),
        }
    }

    pub fn log(&self) -> Arc<MockLog> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl ListingSession for MockSession {
    async fn is_valid(&mut self) -> bool {
        self.valid
    }

    async fn navigate(&mut self, url: &str, _ready_selector: &str) -> NavOutcome {
        let page: u32 = url
            .split("page=")
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        self.log
            .navigations
            .lock()
            .expect("mock log poisoned")
            .push(page);
        self.current_listing_html = self
            .pages
            .get(&page)
            .cloned()
            .unwrap_or_else(|| listing_page(&[]));
        NavOutcome::Loaded
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        if self.detail_open {
            if let Some(err) = self.content_failures.pop_front() {
                return Err(err);
            }
            Ok(self.detail_html.clone())
        } else {
            Ok(self.current_listing_html.clone())
        }
    }

    async fn open_detail(&mut self, _url: &str) -> Result<(), SessionError> {
        if let Some(err) = self.open_failures.pop_front() {
            if err.is_fatal() {
                self.valid = false;
            }
            return Err(err);
        }
        self.detail_open = true;
        self.log.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close_detail(&mut self) -> Result<(), SessionError> {
        if self.detail_open {
            self.detail_open = false;
            if let Some(err) = self.close_failures.pop_front() {
                return Err(err);
            }
            self.log.closes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), SessionError> {
        if let Some(rest) = selector.split("data-page='").nth(1) {
            let target: u32 = rest
                .trim_end_matches(|c| c == '\'' || c == ']')
                .parse()
                .unwrap_or(0);
            if self.dialog_on_click_page == Some(target) {
                self.dialog_on_click_page = None;
                self.dialogs.push_back("unusual traffic detected".to_string());
                return Ok(());
            }
            if self.pages.contains_key(&target) {
                return Ok(());
            }
            return Err(SessionError::ElementNotFound(selector.to_string()));
        }
        Ok(())
    }

    async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> Result<(), SessionError> {
        Ok(())
    }

    async fn attribute(
        &mut self,
        _selector: &str,
        _name: &str,
    ) -> Result<Option<String>, SessionError> {
        Ok(None)
    }

    fn take_dialog(&mut self) -> Option<String> {
        self.dialogs.pop_front()
    }

    async fn reset(&mut self) -> Result<(), SessionError> {
        self.valid = true;
        self.detail_open = false;
        self.log.resets.fetch_add(1, Ordering::Relaxed);
        if let Some((page, html)) = self.page_after_reset.take() {
            self.pages.insert(page, html);
        }
        Ok(())
    }

    async fn screenshot(&mut self, _tag: &str) {}

    async fn shutdown(&mut self) {}
}

/// Minimal profile for controller/fetcher tests.
pub fn test_profile() -> SiteProfile {
    toml::from_str(
        r##"
        name = "test"
        listing_url = "https://test.local/list?page={page}"

        [listing]
        container = "#list"
        row = "#list li"
        manufacturer = ".man"
        detail_link = "a.lnk"

        [listing.identity]
        attribute = "data-mark"
        delimiter = "|"

        [detail]
        content = "body"
        rows = ".spec li"
        label = ".k"
        value = ".v"

        [detail.labels]
        "변속기" = "transmission"
        "색상" = "color"

        [pagination]
        mode = "click"
        container = "#pg"
        next_block = "#pg .next"
        page_attribute = "data-page"
        block_size = 10

        [robot]
        keywords = ["robot-check"]
        empty_markers = ["no-more-results"]
        "##,
    )
    .expect("test profile parses")
}

/// Listing page fixture with one row per id.
pub fn listing_page(ids: &[&str]) -> String {
    let rows: String = ids
        .iter()
        .map(|id| {
            format!(
                r#"<li data-mark="{id}|seg"><a class="lnk" href="https://test.local/d/{id}"></a><span class="man">현대</span></li>"#
            )
        })
        .collect();
    format!(r#"<html><body><ul id="list">{rows}</ul></body></html>"#)
}

/// Detail page fixture with label/value spec rows.
pub fn detail_html(pairs: &[(&str, &str)]) -> String {
    let rows: String = pairs
        .iter()
        .map(|(label, value)| {
            format!(r#"<li><span class="k">{label}</span><span class="v">{value}</span></li>"#)
        })
        .collect();
    format!(r#"<html><body><ul class="spec">{rows}</ul></body></html>"#)
}
