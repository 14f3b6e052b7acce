//! The crawl session controller.
//!
//! Drives one session across the paginated results: cooldown handling,
//! session validity, navigation, per-item extraction and detail fetching,
//! indexing, checkpointing, and pagination advance, with robot-detection
//! interception around every navigation step. Page-level failures reset
//! the session and replay the same page number, never skip it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

use crate::browser::{ListingSession, NavOutcome};
use crate::config::Settings;
use crate::crawler::detail::{DetailFetcher, DetailOutcome};
use crate::crawler::detection::{DetectionState, KeywordDetector, RobotDetector};
use crate::crawler::listing::extract_listings;
use crate::crawler::pagination::{AdvanceOutcome, PaginationWalker};
use crate::export::CsvExporter;
use crate::index::IndexSink;
use crate::models::VehicleRecord;
use crate::site::SiteProfile;

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    AwaitingCooldown,
    Resetting,
    /// Natural completion.
    Done,
    /// Stopped early: shutdown signal or run-level failure.
    Aborted,
}

/// Counters accumulated over one run.
#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub pages_crawled: u32,
    pub records_collected: usize,
    pub indexed: usize,
    pub index_failures: usize,
    pub robot_detections: u32,
    pub session_resets: u32,
}

/// Final result of one run.
#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    pub records: Vec<VehicleRecord>,
    pub stats: RunStats,
}

/// Orchestrates one crawl run over an owned session.
pub struct CrawlController<S: ListingSession> {
    session: S,
    profile: SiteProfile,
    settings: Settings,
    detector: Box<dyn RobotDetector>,
    detection: DetectionState,
    sink: Option<Arc<dyn IndexSink>>,
    exporter: Option<CsvExporter>,
    shutdown: Arc<AtomicBool>,
    state: RunState,
    stats: RunStats,
    records: Vec<VehicleRecord>,
}

impl<S: ListingSession> CrawlController<S> {
    pub fn new(session: S, profile: SiteProfile, settings: Settings) -> Self {
        let detector = Box::new(KeywordDetector::from_profile(&profile));
        Self {
            session,
            profile,
            settings,
            detector,
            detection: DetectionState::new(),
            sink: None,
            exporter: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: RunState::Running,
            stats: RunStats::default(),
            records: Vec::new(),
        }
    }

    /// Swap in a custom robot detector.
    pub fn with_detector(mut self, detector: Box<dyn RobotDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Inject detection state (tests assert on it without globals).
    pub fn with_detection_state(mut self, detection: DetectionState) -> Self {
        self.detection = detection;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn IndexSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_exporter(mut self, exporter: CsvExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Share a shutdown flag; when set, the run drains and aborts cleanly.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Current controller state, for observation mid-run.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run the crawl from `start_page`. The session is torn down on every
    /// exit path; an `Err` is a run-level failure for the outer retry loop.
    pub async fn run(mut self, start_page: u32) -> anyhow::Result<RunReport> {
        let result = self.run_inner(start_page).await;

        // Brief settle before teardown, then release the browser no matter
        // how the run ended.
        tokio::time::sleep(self.settings.delays.session_settle.sample()).await;
        self.session.shutdown().await;

        let state = result?;
        if let Some(exporter) = &self.exporter {
            if !self.records.is_empty() {
                if let Err(e) = exporter.export_all(&self.records) {
                    warn!("Final export failed: {e}");
                }
            }
        }

        Ok(RunReport {
            state,
            records: self.records,
            stats: self.stats,
        })
    }

    async fn run_inner(&mut self, start_page: u32) -> anyhow::Result<RunState> {
        let profile = self.profile.clone();
        let delays = self.settings.delays.clone();
        let crawl = self.settings.crawl.clone();
        let walker = PaginationWalker::new(&profile, &delays);
        let fetcher = DetailFetcher::new(&profile, &delays, crawl.detail_retries);

        let started = Instant::now();
        let max_duration =
            (crawl.max_run_minutes > 0).then(|| Duration::from_secs(crawl.max_run_minutes * 60));

        let mut current_page = start_page;
        let mut pages_crawled = 0u32;
        let mut nav_failures = 0u32;

        loop {
            if self.shutdown_requested() {
                info!("Shutdown requested; stopping crawl");
                return Ok(RunState::Aborted);
            }
            if let Some(max) = max_duration {
                if started.elapsed() >= max {
                    info!("Run duration bound reached; stopping crawl");
                    return Ok(RunState::Done);
                }
            }
            if pages_crawled >= crawl.max_pages {
                info!("Reached maximum page count ({})", crawl.max_pages);
                return Ok(RunState::Done);
            }

            // Honor a pending robot-detection cooldown, sleeping in capped
            // slices so a shutdown signal stays responsive.
            while let Some(remaining) = self.detection.remaining_cooldown() {
                if self.shutdown_requested() {
                    return Ok(RunState::Aborted);
                }
                self.state = RunState::AwaitingCooldown;
                info!("In robot-detection cooldown; {remaining:?} remaining");
                tokio::time::sleep(remaining.min(Duration::from_secs(60))).await;
            }
            self.state = RunState::Running;

            if !self.session.is_valid().await {
                warn!("Session invalid before navigation; resetting");
                self.reset_session().await?;
                continue; // replay the same page
            }

            let nav = walker.navigate_to_page(&mut self.session, current_page).await;
            if self.intercept_dialog() {
                self.reset_session().await?;
                continue;
            }
            match nav {
                NavOutcome::Loaded => {}
                NavOutcome::Failed(reason) => {
                    nav_failures += 1;
                    warn!(
                        "Failed to load page {current_page} (attempt {nav_failures}): {reason}"
                    );
                    if nav_failures > crawl.page_retries {
                        warn!("Page replay budget exhausted; ending run");
                        return Ok(RunState::Done);
                    }
                    self.reset_session().await?;
                    continue;
                }
            }

            let html = match self.session.content().await {
                Ok(html) => html,
                Err(e) if e.is_fatal() => {
                    warn!("Session lost reading page content: {e}");
                    self.reset_session().await?;
                    continue;
                }
                Err(e) => {
                    nav_failures += 1;
                    warn!("Could not read page content: {e}");
                    if nav_failures > crawl.page_retries {
                        return Ok(RunState::Done);
                    }
                    continue;
                }
            };

            if let Some(detection) = self.detector.classify(&html) {
                self.robot_detected(&format!("content marker {:?}", detection.marker));
                self.reset_session().await?;
                continue;
            }
            if profile.matches_empty_marker(&html) {
                info!("Empty-results marker on page {current_page}; crawl complete");
                return Ok(RunState::Done);
            }

            let extraction = extract_listings(&html, &profile, current_page, &self.records);
            info!(
                "Page {current_page}: {} rows, {} new, {} duplicates",
                extraction.total_rows,
                extraction.records.len(),
                extraction.skipped_duplicates
            );
            if extraction.total_rows == 0 {
                info!("No listings on page {current_page}; crawl complete");
                return Ok(RunState::Done);
            }
            nav_failures = 0;

            let total = extraction.records.len();
            let mut retained = 0usize;
            let mut reset_needed = false;
            for (idx, mut candidate) in extraction.records.into_iter().enumerate() {
                if self.shutdown_requested() {
                    return Ok(RunState::Aborted);
                }
                info!(
                    "Processing listing {}/{} on page {current_page} (id {})",
                    idx + 1,
                    total,
                    candidate.listing_id
                );
                if !self.session.is_valid().await {
                    warn!("Session invalid mid-page; resetting");
                    reset_needed = true;
                    break;
                }

                let outcome = fetcher.fetch(&mut self.session, &candidate.detail_url).await;
                if self.intercept_dialog() {
                    reset_needed = true;
                    break;
                }
                match outcome {
                    DetailOutcome::SessionFatal => {
                        warn!("Session-fatal during detail fetch; resetting");
                        reset_needed = true;
                        break;
                    }
                    DetailOutcome::Fetched(detail) => {
                        candidate.merge_detail(detail);
                        self.records.push(candidate);
                        self.stats.records_collected = self.records.len();
                        retained += 1;
                        self.index_latest().await;
                        if crawl.checkpoint_every > 0 && retained % crawl.checkpoint_every == 0 {
                            self.write_checkpoint(current_page, retained);
                        }
                        tokio::time::sleep(delays.item.sample()).await;
                    }
                }
            }
            if reset_needed {
                self.reset_session().await?;
                continue; // replay; already-retained items dedup-skip
            }

            // Page completed without incident.
            self.detection.record_clean_page();
            pages_crawled += 1;
            self.stats.pages_crawled = pages_crawled;
            if pages_crawled >= crawl.max_pages {
                info!("Reached maximum page count ({})", crawl.max_pages);
                return Ok(RunState::Done);
            }

            let advance = walker.advance(&mut self.session, current_page).await;
            if self.intercept_dialog() {
                self.reset_session().await?;
                continue; // replay the page the dialog interrupted
            }
            match advance {
                AdvanceOutcome::Next(next) => current_page = next,
                AdvanceOutcome::End => {
                    info!("Pagination reports no further pages; crawl complete");
                    return Ok(RunState::Done);
                }
                AdvanceOutcome::SessionFatal => {
                    self.reset_session().await?;
                    continue;
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Drain an intercepted native dialog; any dialog counts as a robot
    /// detection regardless of the content detector.
    fn intercept_dialog(&mut self) -> bool {
        match self.session.take_dialog() {
            Some(message) => {
                self.robot_detected(&format!("native dialog {message:?}"));
                true
            }
            None => false,
        }
    }

    fn robot_detected(&mut self, what: &str) {
        self.stats.robot_detections += 1;
        let cooldown = self.detection.record(&self.settings.backoff);
        warn!(
            "Robot detection ({what}); cooling down {cooldown:?} (consecutive: {})",
            self.detection.consecutive()
        );
    }

    async fn reset_session(&mut self) -> anyhow::Result<()> {
        self.state = RunState::Resetting;
        self.stats.session_resets += 1;
        self.session
            .reset()
            .await
            .context("session reset failed")?;
        // Post-reset settle, distinct from the robot cooldown.
        tokio::time::sleep(self.settings.delays.session_settle.sample()).await;
        self.state = RunState::Running;
        Ok(())
    }

    async fn index_latest(&mut self) {
        let Some(sink) = &self.sink else { return };
        let Some(record) = self.records.last() else { return };
        match sink.upsert(record).await {
            Ok(()) => self.stats.indexed += 1,
            Err(e) => {
                // Indexing failure never affects crawl control flow.
                self.stats.index_failures += 1;
                warn!("Indexing listing {} failed: {e}", record.listing_id);
            }
        }
    }

    fn write_checkpoint(&self, page: u32, retained: usize) {
        let Some(exporter) = &self.exporter else { return };
        let start = self.records.len().saturating_sub(retained);
        if let Err(e) = exporter.checkpoint(page, retained, &self.records[start..]) {
            warn!("Checkpoint write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::crawler::testing::{detail_html, listing_page, test_profile, MockSession};
    use crate::crawler::DelayPolicy;
    use crate::index::IndexError;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.delays = DelayPolicy::none();
        settings.backoff.base_secs = 0;
        settings.backoff.max_secs = 0;
        settings.crawl.max_pages = 50;
        settings
    }

    fn controller(session: MockSession) -> CrawlController<MockSession> {
        CrawlController::new(session, test_profile(), test_settings())
    }

    #[tokio::test]
    async fn crawls_pages_until_pagination_ends() {
        let mut session = MockSession::new();
        session.pages.insert(1, listing_page(&["101", "102"]));
        session.pages.insert(2, listing_page(&["103"]));
        session.detail_html = detail_html(&[("변속기", "오토")]);

        let report = controller(session).run(1).await.unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.stats.pages_crawled, 2);
        let ids: Vec<_> = report.records.iter().map(|r| r.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["101", "102", "103"]);
        assert_eq!(
            report.records[0].detail.transmission.as_deref(),
            Some("오토")
        );
    }

    #[tokio::test]
    async fn accumulator_never_holds_duplicate_ids() {
        let mut session = MockSession::new();
        // The same listing appears on both pages.
        session.pages.insert(1, listing_page(&["101", "102"]));
        session.pages.insert(2, listing_page(&["102", "103"]));

        let report = controller(session).run(1).await.unwrap();

        let mut ids: Vec<_> = report.records.iter().map(|r| r.listing_id.clone()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before, "duplicate listing ids in accumulator");
        assert_eq!(before, 3);
    }

    #[tokio::test]
    async fn session_fatal_replays_the_same_page() {
        let mut session = MockSession::new();
        session.pages.insert(1, listing_page(&["101"]));
        // First detail open breaks the session.
        session.open_failures.push_back(crate::browser::SessionError::Invalid(
            "no such session".to_string(),
        ));
        let log = session.log();

        let report = controller(session).run(1).await.unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.stats.session_resets, 1);
        // Replay, not skip: the navigation after the fatal targets page 1 again.
        assert_eq!(log.navigations(), vec![1, 1]);
        assert!(report.records.iter().any(|r| r.listing_id == "101"));
    }

    #[tokio::test]
    async fn dialog_during_advance_is_a_robot_detection_and_replays() {
        let mut session = MockSession::new();
        session.pages.insert(1, listing_page(&["101"]));
        session.pages.insert(2, listing_page(&["102"]));
        session.dialog_on_click_page = Some(2);
        let log = session.log();

        let report = controller(session).run(1).await.unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.stats.robot_detections, 1);
        assert_eq!(report.stats.session_resets, 1);
        // Page 1 was replayed after the dialog, then the crawl reached page 2.
        assert_eq!(log.navigations(), vec![1, 1, 2]);
        let ids: Vec<_> = report.records.iter().map(|r| r.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["101", "102"]);
    }

    #[tokio::test]
    async fn robot_keyword_in_content_triggers_reset() {
        let mut session = MockSession::new();
        session
            .pages
            .insert(1, "<html><body>robot-check</body></html>".to_string());
        // After one reset the mock serves a clean page.
        session.page_after_reset = Some((1, listing_page(&["101"])));

        let report = controller(session).run(1).await.unwrap();

        assert_eq!(report.stats.robot_detections, 1);
        assert_eq!(report.stats.session_resets, 1);
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test]
    async fn empty_page_completes_the_run() {
        let mut session = MockSession::new();
        session.pages.insert(1, listing_page(&[]));

        let report = controller(session).run(1).await.unwrap();
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.stats.pages_crawled, 0);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn max_pages_bounds_the_run() {
        let mut session = MockSession::new();
        for page in 1..=5 {
            let id = format!("{page}00");
            session.pages.insert(page, listing_page(&[id.as_str()]));
        }
        let mut settings = test_settings();
        settings.crawl.max_pages = 2;

        let report = CrawlController::new(session, test_profile(), settings)
            .run(1)
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.stats.pages_crawled, 2);
        assert_eq!(report.records.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_flag_aborts_cleanly() {
        let mut session = MockSession::new();
        session.pages.insert(1, listing_page(&["101"]));
        let shutdown = Arc::new(AtomicBool::new(true));

        let report = controller(session)
            .with_shutdown(shutdown)
            .run(1)
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Aborted);
        assert!(report.records.is_empty());
    }

    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IndexSink for FailingSink {
        async fn upsert(&self, _record: &VehicleRecord) -> Result<(), IndexError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(IndexError::Api {
                status: 500,
                body: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn index_failures_never_stop_the_crawl() {
        let mut session = MockSession::new();
        session.pages.insert(1, listing_page(&["101", "102"]));
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });

        let report = controller(session)
            .with_sink(sink.clone())
            .run(1)
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.stats.index_failures, 2);
        assert_eq!(sink.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn invalid_session_resets_before_navigating() {
        let mut session = MockSession::new();
        session.valid = false;
        session.pages.insert(1, listing_page(&["101"]));
        let log = session.log();

        let report = controller(session).run(1).await.unwrap();
        assert_eq!(report.stats.session_resets, 1);
        assert_eq!(log.resets(), 1);
        assert_eq!(report.records.len(), 1);
    }
}
