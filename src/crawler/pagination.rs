//! Pagination: loading a specific results page and advancing to the next.
//!
//! Advancing is site-dependent: the main portal pages through in-page
//! controls (with a block jump every ten pages), the secondary marketplace
//! just takes the next page number in the URL. A missing control is the
//! terminal condition for the run.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::browser::{ListingSession, NavOutcome, SessionError};
use crate::crawler::DelayPolicy;
use crate::site::{AdvanceMode, SiteProfile};

/// Tagged result of a pagination advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Moved to this page number.
    Next(u32),
    /// No further page exists.
    End,
    /// The session is broken; reset and replay.
    SessionFatal,
}

/// Drives pagination for one site profile.
pub struct PaginationWalker<'a> {
    profile: &'a SiteProfile,
    delays: &'a DelayPolicy,
    wait_timeout: Duration,
}

impl<'a> PaginationWalker<'a> {
    pub fn new(profile: &'a SiteProfile, delays: &'a DelayPolicy) -> Self {
        Self {
            profile,
            delays,
            wait_timeout: Duration::from_secs(10),
        }
    }

    /// Load a results page by number and wait for the listing container,
    /// with a human-like delay once it renders.
    pub async fn navigate_to_page<S: ListingSession>(
        &self,
        session: &mut S,
        page: u32,
    ) -> NavOutcome {
        let url = self.profile.listing_url_for(page);
        info!("Navigating to page {page}");
        let outcome = session
            .navigate(&url, &self.profile.listing.container)
            .await;
        if outcome == NavOutcome::Loaded {
            tokio::time::sleep(self.delays.page_load.sample()).await;
        }
        outcome
    }

    /// Advance from `current` to the next page.
    pub async fn advance<S: ListingSession>(
        &self,
        session: &mut S,
        current: u32,
    ) -> AdvanceOutcome {
        match self.profile.pagination.mode {
            AdvanceMode::Url => AdvanceOutcome::Next(current + 1),
            AdvanceMode::Click => self.advance_by_click(session, current).await,
        }
    }

    async fn advance_by_click<S: ListingSession>(
        &self,
        session: &mut S,
        current: u32,
    ) -> AdvanceOutcome {
        let pagination = &self.profile.pagination;

        // At a block boundary the next page lives behind the block control,
        // which carries the target page number in its data attribute.
        let (selector, next_page) = if pagination.block_size > 0
            && current % pagination.block_size == 0
        {
            let Some(next_block) = pagination.next_block.as_deref() else {
                return AdvanceOutcome::End;
            };
            let target = match session
                .attribute(next_block, &pagination.page_attribute)
                .await
            {
                Ok(Some(value)) => match value.trim().parse::<u32>() {
                    Ok(n) => n,
                    Err(_) => {
                        warn!("Next-block control has unparseable page number: {value:?}");
                        return AdvanceOutcome::End;
                    }
                },
                Ok(None) => return AdvanceOutcome::End,
                Err(e) if e.is_fatal() => return AdvanceOutcome::SessionFatal,
                Err(e) => {
                    debug!("Next-block control not found: {e}");
                    return AdvanceOutcome::End;
                }
            };
            (next_block.to_string(), target)
        } else {
            (self.profile.page_link_selector(current + 1), current + 1)
        };

        match session.click(&selector).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return AdvanceOutcome::SessionFatal,
            Err(SessionError::ElementNotFound(_)) | Err(SessionError::Timeout { .. }) => {
                info!("No pagination control for page {next_page}; end of results");
                return AdvanceOutcome::End;
            }
            Err(e) => {
                warn!("Pagination click failed: {e}");
                return AdvanceOutcome::End;
            }
        }

        tokio::time::sleep(self.delays.pagination.sample()).await;

        match session
            .wait_for(&self.profile.listing.container, self.wait_timeout)
            .await
        {
            Ok(()) => AdvanceOutcome::Next(next_page),
            Err(e) if e.is_fatal() => AdvanceOutcome::SessionFatal,
            Err(e) => {
                warn!("Listing container missing after pagination: {e}");
                AdvanceOutcome::End
            }
        }
    }
}
