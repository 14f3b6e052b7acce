//! CLI commands implementation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::Settings;
use crate::crawler::RunReport;
use crate::export::{summarize, RunSummary};
use crate::index::{IndexSink, OpenSearchSink};
use crate::site::SiteProfile;

#[derive(Parser)]
#[command(name = "carhive")]
#[command(about = "Used-car listing acquisition and search indexing system")]
#[command(version)]
pub struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a listing site and index the results
    Crawl {
        /// Built-in site profile (encar, carku) or path to a profile TOML
        site: String,
        /// Page number to start crawling from
        #[arg(long)]
        start_page: Option<u32>,
        /// Maximum number of pages to crawl
        #[arg(short, long)]
        pages: Option<u32>,
        /// Whole-run retry budget
        #[arg(long)]
        retries: Option<u32>,
        /// Run with a visible browser window
        #[arg(long)]
        headed: bool,
        /// Skip search indexing
        #[arg(long)]
        no_index: bool,
        #[command(flatten)]
        index: IndexArgs,
    },

    /// Create the search index and its mappings
    InitIndex {
        /// Site profile the index is for
        site: String,
        #[command(flatten)]
        index: IndexArgs,
    },

    /// Show the search index document count
    Status {
        /// Site profile the index is for
        site: String,
        #[command(flatten)]
        index: IndexArgs,
    },
}

/// Index connection arguments, overriding the settings file.
#[derive(Args)]
struct IndexArgs {
    /// OpenSearch-compatible endpoint
    #[arg(long, env = "CARHIVE_INDEX_URL")]
    index_url: Option<String>,

    #[arg(long, env = "CARHIVE_INDEX_USERNAME")]
    index_username: Option<String>,

    #[arg(long, env = "CARHIVE_INDEX_PASSWORD", hide_env_values = true)]
    index_password: Option<String>,

    /// Index name (defaults to <site>_vehicles)
    #[arg(long)]
    index_name: Option<String>,
}

impl IndexArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.index_url {
            settings.index.url = url.clone();
        }
        if let Some(username) = &self.index_username {
            settings.index.username = Some(username.clone());
        }
        if let Some(password) = &self.index_password {
            settings.index.password = Some(password.clone());
        }
        if let Some(name) = &self.index_name {
            settings.index.index = Some(name.clone());
        }
    }
}

/// Parse arguments and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Crawl {
            site,
            start_page,
            pages,
            retries,
            headed,
            no_index,
            index,
        } => {
            index.apply(&mut settings);
            if let Some(start) = start_page {
                settings.crawl.start_page = start;
            }
            if let Some(max) = pages {
                settings.crawl.max_pages = max;
            }
            if let Some(budget) = retries {
                settings.crawl.run_retries = budget;
            }
            if headed {
                settings.crawl.headless = false;
            }
            crawl(&site, settings, no_index).await
        }
        Commands::InitIndex { site, index } => {
            index.apply(&mut settings);
            let profile = load_profile(&site)?;
            let sink = open_sink(&settings, &profile)?;
            sink.ensure_index().await?;
            println!("Index {} is ready", style(sink.index_name()).green());
            Ok(())
        }
        Commands::Status { site, index } => {
            index.apply(&mut settings);
            let profile = load_profile(&site)?;
            let sink = open_sink(&settings, &profile)?;
            let count = sink.doc_count().await?;
            println!(
                "Index {} holds {} documents",
                style(sink.index_name()).green(),
                style(count).bold()
            );
            Ok(())
        }
    }
}

/// Resolve a built-in profile name or a path to a profile file.
fn load_profile(site: &str) -> anyhow::Result<SiteProfile> {
    let path = Path::new(site);
    let profile = if path.extension().is_some() || path.exists() {
        SiteProfile::from_path(path)?
    } else {
        SiteProfile::builtin(site)?
    };
    Ok(profile)
}

fn open_sink(settings: &Settings, profile: &SiteProfile) -> anyhow::Result<OpenSearchSink> {
    let index_name = settings.index.index_for(&profile.name);
    OpenSearchSink::new(&settings.index, index_name).context("could not build the index client")
}

/// Crawl with the whole-run retry loop around it.
async fn crawl(site: &str, settings: Settings, no_index: bool) -> anyhow::Result<()> {
    let profile = load_profile(site)?;
    let start_page = settings.crawl.start_page;
    let run_retries = settings.crawl.run_retries.max(1);

    // Indexing is a side output: if the index is unreachable the crawl
    // proceeds without it.
    let sink: Option<Arc<dyn IndexSink>> = if no_index {
        None
    } else {
        let sink = open_sink(&settings, &profile)?;
        match sink.ensure_index().await {
            Ok(()) => Some(Arc::new(sink)),
            Err(e) => {
                warn!("Search index unavailable ({e}); continuing without indexing");
                None
            }
        }
    };

    // Termination signals flip the shutdown flag; the controller drains and
    // releases the browser before we exit.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Termination signal received; finishing up");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    info!(
        "Starting crawl of {} from page {} (max {} pages)",
        profile.name, start_page, settings.crawl.max_pages
    );

    let mut attempt = 0u32;
    let report = loop {
        attempt += 1;
        let spinner = crawl_spinner(&profile.name, attempt, run_retries);
        let result = crawl_once(
            &profile,
            &settings,
            sink.clone(),
            Arc::clone(&shutdown),
            start_page,
        )
        .await;
        spinner.finish_and_clear();

        match result {
            Ok(report) => break report,
            Err(e) => {
                if shutdown.load(Ordering::Relaxed) {
                    return Err(e.context("crawl interrupted"));
                }
                if attempt >= run_retries {
                    return Err(e.context(format!("crawl failed after {attempt} attempts")));
                }
                let wait = settings.delays.run_retry.sample();
                warn!("Crawl attempt {attempt} failed: {e:#}; retrying in {wait:?}");
                tokio::time::sleep(wait).await;
            }
        }
    };

    print_report(&report, summarize(&report.records));
    Ok(())
}

fn crawl_spinner(site: &str, attempt: u32, retries: u32) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner} {msg}") {
        spinner.set_style(template);
    }
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message(format!("Crawling {site} (attempt {attempt}/{retries})"));
    spinner
}

#[cfg(feature = "browser")]
async fn crawl_once(
    profile: &SiteProfile,
    settings: &Settings,
    sink: Option<Arc<dyn IndexSink>>,
    shutdown: Arc<AtomicBool>,
    start_page: u32,
) -> anyhow::Result<RunReport> {
    use crate::browser::{CrawlSession, SessionConfig};
    use crate::crawler::CrawlController;
    use crate::export::CsvExporter;

    let session = CrawlSession::launch(SessionConfig {
        headless: settings.crawl.headless,
        screenshots_dir: settings.screenshots_dir.clone(),
        ..Default::default()
    })
    .await
    .context("could not launch the browser session")?;

    let mut controller = CrawlController::new(session, profile.clone(), settings.clone())
        .with_shutdown(shutdown)
        .with_exporter(CsvExporter::new(&settings.data_dir, profile.name.as_str()));
    if let Some(sink) = sink {
        controller = controller.with_sink(sink);
    }
    controller.run(start_page).await
}

#[cfg(not(feature = "browser"))]
async fn crawl_once(
    _profile: &SiteProfile,
    _settings: &Settings,
    _sink: Option<Arc<dyn IndexSink>>,
    _shutdown: Arc<AtomicBool>,
    _start_page: u32,
) -> anyhow::Result<RunReport> {
    Err(anyhow::anyhow!(
        "Browser support not compiled. Rebuild with: cargo build --features browser"
    ))
}

fn print_report(report: &RunReport, summary: RunSummary) {
    println!();
    println!("{}", style("Crawl summary").bold());
    println!("  Listings collected: {}", style(summary.total).bold());
    println!("  Pages crawled: {}", report.stats.pages_crawled);
    println!(
        "  Indexed: {} ({} failures)",
        report.stats.indexed, report.stats.index_failures
    );
    println!(
        "  Robot detections: {} / session resets: {}",
        report.stats.robot_detections, report.stats.session_resets
    );

    if !summary.by_manufacturer.is_empty() {
        println!("  By manufacturer:");
        for (manufacturer, count) in &summary.by_manufacturer {
            println!("    {manufacturer}: {count}");
        }
    }
    if !summary.by_fuel.is_empty() {
        println!("  By fuel:");
        for (fuel, count) in &summary.by_fuel {
            println!("    {fuel}: {count}");
        }
    }
    if let (Some(min), Some(max), Some(mean)) =
        (summary.price_min, summary.price_max, summary.price_mean)
    {
        println!("  Price (만원): min {min:.0} / max {max:.0} / mean {mean:.1}");
    }
}
