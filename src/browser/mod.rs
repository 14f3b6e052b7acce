//! Browser session handling for anti-bot protected listing sites.
//!
//! The crawl controller drives a [`ListingSession`]; the chromiumoxide-backed
//! [`CrawlSession`] is the production implementation, and tests use mock
//! sessions to exercise failure paths without a browser.

mod stealth;

#[cfg(feature = "browser")]
mod session;

pub use stealth::{random_user_agent, STEALTH_SCRIPTS, USER_AGENTS};

#[cfg(feature = "browser")]
pub use session::{CrawlSession, SessionConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from browser session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying session is gone; only a reset can recover.
    #[error("browser session is no longer valid: {0}")]
    Invalid(String),

    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("browser transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// Whether this error invalidates the whole session.
    ///
    /// Fatal errors propagate as a reset request; everything else is
    /// retryable within the caller's budget.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Outcome of loading a listing page.
///
/// Navigation failures come back as a value, not an error, so the
/// controller decides remediation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavOutcome {
    /// The page loaded and the ready selector appeared.
    Loaded,
    /// Load or readiness failed.
    Failed(String),
}

/// One browser automation session.
///
/// The detail-context pair must stay symmetric: every successful
/// `open_detail` is matched by exactly one `close_detail` on every exit
/// path. A leaked detail context corrupts all subsequent navigation.
#[async_trait]
pub trait ListingSession: Send {
    /// Probe the session; never errors.
    async fn is_valid(&mut self) -> bool;

    /// Load a URL in the main context and wait for `ready_selector`.
    async fn navigate(&mut self, url: &str, ready_selector: &str) -> NavOutcome;

    /// HTML snapshot of the current context (detail if open, else main).
    async fn content(&mut self) -> Result<String, SessionError>;

    /// Open a detail URL in an isolated context.
    async fn open_detail(&mut self, url: &str) -> Result<(), SessionError>;

    /// Close the detail context and return to the main context.
    async fn close_detail(&mut self) -> Result<(), SessionError>;

    /// Scroll an element into view and click it, in the current context.
    async fn click(&mut self, selector: &str) -> Result<(), SessionError>;

    /// Wait until a selector appears in the current context.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError>;

    /// Read an attribute off the first match in the current context.
    async fn attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    /// Drain one intercepted native dialog message, if any appeared since
    /// the last call.
    fn take_dialog(&mut self) -> Option<String>;

    /// Tear down (best-effort) and bring up a fresh session with a rotated
    /// identity. Safe to call on an already-broken session.
    async fn reset(&mut self) -> Result<(), SessionError>;

    /// Best-effort diagnostic capture; failures are logged, never returned.
    async fn screenshot(&mut self, tag: &str);

    /// Release the browser and its OS processes.
    async fn shutdown(&mut self);
}
