//! Robot-countermeasure detection and cooldown state.
//!
//! Detection state is an explicit value passed into the controller, not a
//! global, so tests can inject and inspect it. What counts as a
//! countermeasure is pluggable: native dialogs always do, page content is
//! classified by a [`RobotDetector`] (keyword matching is fragile and
//! site-dependent, so it lives behind a trait and the keywords live in the
//! site profile).

use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::site::SiteProfile;

/// Back-off parameters for robot detections.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Cooldown after the first detection; doubles per consecutive detection.
    pub base_secs: u64,
    /// Cooldown ceiling.
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 60,
            max_secs: 900,
        }
    }
}

/// Consecutive-detection counter and cooldown deadline.
#[derive(Debug, Clone, Default)]
pub struct DetectionState {
    consecutive: u32,
    cooldown_until: Option<Instant>,
}

impl DetectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one detection: bumps the counter, computes the exponential
    /// cooldown, sets the deadline, and returns the cooldown.
    pub fn record(&mut self, config: &BackoffConfig) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        let cooldown = self.cooldown_for(config, self.consecutive);
        self.cooldown_until = Some(Instant::now() + cooldown);
        cooldown
    }

    /// Cooldown for the nth consecutive detection: `base * 2^n`, capped.
    fn cooldown_for(&self, config: &BackoffConfig, count: u32) -> Duration {
        let factor = 2u64.saturating_pow(count.min(32));
        let secs = config.base_secs.saturating_mul(factor).min(config.max_secs);
        Duration::from_secs(secs)
    }

    /// Remaining cooldown, if a deadline is still in the future.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let deadline = self.cooldown_until?;
        let now = Instant::now();
        (deadline > now).then(|| deadline - now)
    }

    /// Clear the streak after a page completes without incident.
    pub fn record_clean_page(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// What a detector saw in page content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// The marker that triggered, for logging.
    pub marker: String,
}

/// Classifies page content as a robot countermeasure or not.
pub trait RobotDetector: Send + Sync {
    fn classify(&self, html: &str) -> Option<Detection>;
}

/// Keyword-matching detector driven by the site profile's marker list.
pub struct KeywordDetector {
    keywords: Vec<String>,
}

impl KeywordDetector {
    pub fn from_profile(profile: &SiteProfile) -> Self {
        Self {
            keywords: profile.robot.keywords.clone(),
        }
    }

    pub fn new(keywords: Vec<String>) -> Self {
        Self { keywords }
    }
}

impl RobotDetector for KeywordDetector {
    fn classify(&self, html: &str) -> Option<Detection> {
        let lower = html.to_lowercase();
        self.keywords
            .iter()
            .find(|k| lower.contains(k.to_lowercase().as_str()))
            .map(|k| Detection { marker: k.clone() })
    }
}
