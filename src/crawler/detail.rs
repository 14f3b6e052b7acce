//! Detail-page fetching.
//!
//! Opens the listing's detail view in an isolated context, activates the
//! full-specification control when the site has one, and reads the
//! label/value rows through the label-normalization table. The context is
//! closed and focus returned to the main context on every exit path; a
//! close failure is session-fatal.

use std::time::Duration;

use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::browser::{ListingSession, SessionError};
use crate::crawler::DelayPolicy;
use crate::models::DetailSpec;
use crate::site::SiteProfile;

/// Tagged result of a detail fetch.
///
/// `SessionFatal` asks the controller for a session reset; it is distinct
/// from an ordinary retry and short-circuits the attempt budget.
#[derive(Debug)]
pub enum DetailOutcome {
    /// Collected fields; possibly partial or empty after repeated failures.
    Fetched(DetailSpec),
    /// The session is broken; reset and replay the page.
    SessionFatal,
}

/// Fetches one detail page within a bounded attempt budget.
pub struct DetailFetcher<'a> {
    profile: &'a SiteProfile,
    delays: &'a DelayPolicy,
    max_attempts: u32,
    wait_timeout: Duration,
}

impl<'a> DetailFetcher<'a> {
    pub fn new(profile: &'a SiteProfile, delays: &'a DelayPolicy, max_attempts: u32) -> Self {
        Self {
            profile,
            delays,
            max_attempts: max_attempts.max(1),
            wait_timeout: Duration::from_secs(10),
        }
    }

    /// Fetch the detail fields for one listing.
    pub async fn fetch<S: ListingSession>(&self, session: &mut S, url: &str) -> DetailOutcome {
        if !session.is_valid().await {
            return DetailOutcome::SessionFatal;
        }

        let mut collected = DetailSpec::default();

        for attempt in 1..=self.max_attempts {
            match session.open_detail(url).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return DetailOutcome::SessionFatal,
                Err(e) => {
                    warn!("Opening detail view failed (attempt {attempt}): {e}");
                    continue;
                }
            }

            let result = self.extract(session, &mut collected).await;

            // Close the isolated context regardless of how extraction went;
            // failing to return to the main context is unrecoverable.
            if let Err(e) = session.close_detail().await {
                warn!("Could not return to the main context: {e}");
                return DetailOutcome::SessionFatal;
            }

            match result {
                Ok(()) => return DetailOutcome::Fetched(collected),
                Err(e) if e.is_fatal() => return DetailOutcome::SessionFatal,
                Err(e) => {
                    warn!("Detail extraction failed (attempt {attempt}): {e}");
                    session.screenshot("detail").await;
                }
            }
        }

        debug!(
            "Detail attempt budget exhausted for {url}; returning {} collected fields",
            collected.len()
        );
        DetailOutcome::Fetched(collected)
    }

    async fn extract<S: ListingSession>(
        &self,
        session: &mut S,
        collected: &mut DetailSpec,
    ) -> Result<(), SessionError> {
        session
            .wait_for(&self.profile.detail.content, self.wait_timeout)
            .await?;
        tokio::time::sleep(self.delays.detail_load.sample()).await;

        if let Some(button) = &self.profile.detail.button {
            session.click(button).await?;
            tokio::time::sleep(self.delays.scroll.sample()).await;
            if let Some(panel) = &self.profile.detail.panel {
                session.wait_for(panel, self.wait_timeout).await?;
            }
        }

        let html = session.content().await?;
        parse_detail_rows(&html, self.profile, collected);
        Ok(())
    }
}

/// Read label/value rows out of the specification panel.
///
/// A failure on one row logs and continues; it never aborts the fetch.
pub fn parse_detail_rows(html: &str, profile: &SiteProfile, collected: &mut DetailSpec) {
    let detail = &profile.detail;
    let (Ok(row_sel), Ok(label_sel), Ok(value_sel)) = (
        Selector::parse(&detail.rows),
        Selector::parse(&detail.label),
        Selector::parse(&detail.value),
    ) else {
        warn!("Failed to parse detail selectors for {}", profile.name);
        return;
    };

    let document = Html::parse_document(html);
    for row in document.select(&row_sel) {
        let label = match row.select(&label_sel).next() {
            Some(el) => el.text().collect::<String>(),
            None => {
                debug!("Spec row without a label, skipping");
                continue;
            }
        };
        let value = match row.select(&value_sel).next() {
            Some(el) => el.text().collect::<String>().trim().to_string(),
            None => {
                debug!("Spec row {label:?} without a value, skipping");
                continue;
            }
        };

        let normalized = profile.normalize_label(&label);
        if normalized.is_empty() || value.is_empty() {
            continue;
        }
        let field = profile.canonical_field(&normalized);
        collected.set(field, value);
    }
}
