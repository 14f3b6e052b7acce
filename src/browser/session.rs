//! chromiumoxide-backed crawl session.
//!
//! Owns one browser plus a main listing page and, at most, one isolated
//! detail page. Native dialogs are intercepted by a listener task that
//! accepts them and queues the message for the controller, which treats
//! them as robot-detection signals.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams, EventJavascriptDialogOpening,
    HandleJavaScriptDialogParams, NavigateParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{random_user_agent, ListingSession, NavOutcome, SessionError, STEALTH_SCRIPTS};

/// JavaScript to wait for page ready state.
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// Browser session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub headless: bool,
    /// Directory for diagnostic screenshots.
    pub screenshots_dir: PathBuf,
    /// Page-load timeout.
    pub nav_timeout: Duration,
    /// How long to wait for selectors to appear.
    pub wait_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            screenshots_dir: PathBuf::from("screenshots"),
            nav_timeout: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Browser-backed [`ListingSession`].
pub struct CrawlSession {
    config: SessionConfig,
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    main_page: Option<Page>,
    detail_page: Option<Page>,
    dialogs: Arc<Mutex<VecDeque<String>>>,
    listener_tasks: Vec<JoinHandle<()>>,
    user_agent: &'static str,
}

impl CrawlSession {
    /// Launch a browser and prepare the main listing page.
    pub async fn launch(config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Self {
            config,
            browser: None,
            handler_task: None,
            main_page: None,
            detail_page: None,
            dialogs: Arc::new(Mutex::new(VecDeque::new())),
            listener_tasks: Vec::new(),
            user_agent: random_user_agent(),
        };
        session.start().await?;
        Ok(session)
    }

    /// Find a Chrome/Chromium executable.
    fn find_chrome() -> Result<PathBuf, SessionError> {
        for path in CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                debug!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }

        for cmd in &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        debug!("Found Chrome in PATH: {}", path);
                        return Ok(PathBuf::from(path));
                    }
                }
            }
        }

        Err(SessionError::Transport(
            "Chrome/Chromium not found; install chromium or google-chrome".to_string(),
        ))
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        let chrome_path = Self::find_chrome()?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .window_size(1920, 1080);

        // with_head means NOT headless, confusingly
        if !self.config.headless {
            builder = builder.with_head();
        }

        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        let browser_config = builder.build().map_err(SessionError::Transport)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;
        self.prepare_page(&page).await?;

        info!(
            "Browser session started (headless={}, ua={:?})",
            self.config.headless, self.user_agent
        );

        self.browser = Some(browser);
        self.handler_task = Some(handler_task);
        self.main_page = Some(page);
        Ok(())
    }

    /// Apply the session identity and attach the dialog interceptor.
    async fn prepare_page(&mut self, page: &Page) -> Result<(), SessionError> {
        page.execute(SetUserAgentOverrideParams::new(self.user_agent.to_string()))
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;
        self.attach_dialog_listener(page).await?;
        Ok(())
    }

    async fn attach_dialog_listener(&mut self, page: &Page) -> Result<(), SessionError> {
        let mut events = page
            .event_listener::<EventJavascriptDialogOpening>()
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;

        let queue = Arc::clone(&self.dialogs);
        let dialog_page = page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                warn!("Intercepted native dialog: {:?}", event.message);
                if let Err(e) = dialog_page
                    .execute(HandleJavaScriptDialogParams::new(true))
                    .await
                {
                    debug!("Failed to dismiss dialog: {}", e);
                }
                if let Ok(mut dialogs) = queue.lock() {
                    dialogs.push_back(event.message.clone());
                }
            }
        });
        self.listener_tasks.push(task);
        Ok(())
    }

    /// Apply stealth evasion scripts to a page.
    async fn apply_stealth(&self, page: &Page) {
        for script in STEALTH_SCRIPTS {
            if let Err(e) = page.evaluate(script.to_string()).await {
                debug!("Stealth script injection skipped: {}", e);
            }
        }
    }

    fn current_page(&self) -> Result<&Page, SessionError> {
        self.detail_page
            .as_ref()
            .or(self.main_page.as_ref())
            .ok_or_else(|| SessionError::Invalid("session not started".to_string()))
    }

    /// Navigate a page to a URL, bounded by the configured timeout.
    async fn goto(&self, page: &Page, url: &str) -> Result<(), SessionError> {
        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(SessionError::Transport)?;

        tokio::time::timeout(self.config.nav_timeout, page.execute(nav_params))
            .await
            .map_err(|_| SessionError::Timeout {
                what: format!("navigation to {url}"),
                timeout: self.config.nav_timeout,
            })?
            .map_err(|e| classify_cdp_error(&e.to_string()))?;
        Ok(())
    }

    /// Wait for the page to reach a ready state; best-effort.
    async fn wait_for_page_ready(&self, page: &Page) {
        match tokio::time::timeout(
            self.config.nav_timeout,
            page.evaluate(WAIT_FOR_READY_SCRIPT.to_string()),
        )
        .await
        {
            Ok(Ok(result)) => {
                let state: String = result
                    .into_value()
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for page ready state"),
        }
    }

    /// Poll until a selector appears on the given page.
    async fn wait_for_selector(
        &self,
        page: &Page,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match page.find_element(selector).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    let classified = classify_cdp_error(&e.to_string());
                    if classified.is_fatal() {
                        return Err(classified);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::Timeout {
                    what: format!("selector {selector:?}"),
                    timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}

#[async_trait]
impl ListingSession for CrawlSession {
    async fn is_valid(&mut self) -> bool {
        match &self.main_page {
            Some(page) => page.url().await.is_ok(),
            None => false,
        }
    }

    async fn navigate(&mut self, url: &str, ready_selector: &str) -> NavOutcome {
        let page = match &self.main_page {
            Some(page) => page.clone(),
            None => return NavOutcome::Failed("session not started".to_string()),
        };

        if let Err(e) = self.goto(&page, url).await {
            return NavOutcome::Failed(e.to_string());
        }

        self.wait_for_page_ready(&page).await;

        if let Err(e) = self
            .wait_for_selector(&page, ready_selector, self.config.wait_timeout)
            .await
        {
            return NavOutcome::Failed(e.to_string());
        }

        self.apply_stealth(&page).await;
        NavOutcome::Loaded
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        let page = self.current_page()?;
        page.content()
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))
    }

    async fn open_detail(&mut self, url: &str) -> Result<(), SessionError> {
        if self.detail_page.is_some() {
            // A leaked detail context corrupts later navigation; close it first.
            warn!("Detail context already open; closing before reopening");
            self.close_detail().await?;
        }

        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| SessionError::Invalid("session not started".to_string()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;

        page.execute(SetUserAgentOverrideParams::new(self.user_agent.to_string()))
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;
        self.attach_dialog_listener(&page).await?;

        let opened = self.goto(&page, url).await;
        match opened {
            Ok(()) => {
                self.wait_for_page_ready(&page).await;
                self.apply_stealth(&page).await;
                self.detail_page = Some(page);
                Ok(())
            }
            Err(e) => {
                // Never leave the half-open context behind.
                let _ = page.close().await;
                Err(e)
            }
        }
    }

    async fn close_detail(&mut self) -> Result<(), SessionError> {
        if let Some(page) = self.detail_page.take() {
            if let Err(e) = page.close().await {
                // Failing to get back to the main context is unrecoverable.
                return Err(SessionError::Invalid(format!(
                    "failed to close detail context: {e}"
                )));
            }
        }
        if let Some(main) = &self.main_page {
            main.bring_to_front()
                .await
                .map_err(|e| SessionError::Invalid(format!("failed to refocus main context: {e}")))?;
        }
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), SessionError> {
        let page = self.current_page()?.clone();
        let element = tokio::time::timeout(self.config.wait_timeout, page.find_element(selector))
            .await
            .map_err(|_| SessionError::Timeout {
                what: format!("selector {selector:?}"),
                timeout: self.config.wait_timeout,
            })?
            .map_err(|_| SessionError::ElementNotFound(selector.to_string()))?;

        element
            .scroll_into_view()
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        let page = self.current_page()?.clone();
        self.wait_for_selector(&page, selector, timeout).await
    }

    async fn attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        let page = self.current_page()?.clone();
        let element = page
            .find_element(selector)
            .await
            .map_err(|_| SessionError::ElementNotFound(selector.to_string()))?;
        element
            .attribute(name)
            .await
            .map_err(|e| classify_cdp_error(&e.to_string()))
    }

    fn take_dialog(&mut self) -> Option<String> {
        self.dialogs.lock().ok()?.pop_front()
    }

    async fn reset(&mut self) -> Result<(), SessionError> {
        self.shutdown().await;
        self.user_agent = random_user_agent();
        self.start().await?;
        info!("Browser session reset with fresh identity");
        Ok(())
    }

    async fn screenshot(&mut self, tag: &str) {
        let page = match self.current_page() {
            Ok(page) => page.clone(),
            Err(_) => return,
        };

        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            ..Default::default()
        };
        let data = match page.screenshot(params).await {
            Ok(data) => data,
            Err(e) => {
                warn!("Screenshot capture failed ({}): {}", tag, e);
                return;
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.config.screenshots_dir).await {
            warn!("Could not create screenshots dir: {}", e);
            return;
        }
        let filename = self.config.screenshots_dir.join(format!(
            "error_{}_{}.png",
            tag,
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        match tokio::fs::write(&filename, data).await {
            Ok(()) => info!("Saved screenshot to {}", filename.display()),
            Err(e) => warn!("Screenshot write failed: {}", e),
        }
    }

    async fn shutdown(&mut self) {
        for task in self.listener_tasks.drain(..) {
            task.abort();
        }
        if let Some(page) = self.detail_page.take() {
            let _ = page.close().await;
        }
        self.main_page = None;
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("Browser close failed (already gone?): {}", e);
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        if let Ok(mut dialogs) = self.dialogs.lock() {
            dialogs.clear();
        }
    }
}

/// Map a CDP error string onto the session error taxonomy.
///
/// Connection-level failures mean the session is gone and only a reset can
/// recover, mirroring how "invalid session id" is treated on the WebDriver
/// side of the fence.
fn classify_cdp_error(message: &str) -> SessionError {
    let lower = message.to_lowercase();
    let fatal = ["invalid session", "no such session", "connection", "channel closed", "browser closed", "websocket"]
        .iter()
        .any(|marker| lower.contains(marker));
    if fatal {
        SessionError::Invalid(message.to_string())
    } else {
        SessionError::Transport(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdp_error_classification_separates_fatal() {
        assert!(classify_cdp_error("Websocket connection closed").is_fatal());
        assert!(classify_cdp_error("no such session").is_fatal());
        assert!(!classify_cdp_error("Node with given id not found").is_fatal());
    }
}
