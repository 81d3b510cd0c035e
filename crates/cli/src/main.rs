//! rescache command-line driver.
//!
//! Retrieves URLs through the low-level cache backed by a SQLite disc store
//! and writes their bodies to stdout. Logging goes to stderr so bodies can be
//! piped.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rescache_client::{DataFetcher, FetchConfig, HttpFetcher, SchemeRouter, canonicalize};
use rescache_core::config::AppConfig;
use rescache_core::llcache::callback;
use rescache_core::{BackingStore, Cache, CacheEvent, Delivery, HandleId, NullStore, RetrieveFlags, SqliteStore};

/// Longest sleep between polls while fetches are in flight.
const IDLE_POLL_MS: u64 = 10;

#[derive(Parser)]
#[command(name = "rescache", version, about = "Retrieve resources through a persistent HTTP cache")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Retrieve URLs and print their bodies.
    Fetch {
        /// Addresses to retrieve; a missing scheme defaults to https.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Bypass cached copies.
        #[arg(long)]
        force: bool,

        /// Print response headers before each body.
        #[arg(long)]
        headers: bool,
    },
}

/// What one retrieval has produced so far.
#[derive(Default)]
struct Page {
    headers: Vec<String>,
    body: Vec<u8>,
    error: Option<String>,
    done: bool,
}

fn init_logging(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn page_callback(page: Rc<RefCell<Page>>, show_headers: bool) -> rescache_core::HandleCallback {
    callback(move |cache: &mut Cache, handle: HandleId, event: &CacheEvent| {
        let mut page = page.borrow_mut();
        match event {
            CacheEvent::HadHeaders if show_headers => {
                page.headers = cache
                    .headers(handle)
                    .unwrap_or_default()
                    .iter()
                    .map(|h| if h.value.is_empty() { h.name.clone() } else { format!("{}: {}", h.name, h.value) })
                    .collect();
            }
            CacheEvent::HadData(chunk) => page.body.extend_from_slice(chunk),
            CacheEvent::Done => page.done = true,
            CacheEvent::Error { code, message } => {
                page.error = Some(match message {
                    Some(message) => format!("{code}: {message}"),
                    None => code.to_string(),
                });
                page.done = true;
            }
            CacheEvent::Redirect { from, to } => tracing::info!(%from, %to, "redirected"),
            CacheEvent::Progress(text) => tracing::debug!(%text, "progress"),
            _ => {}
        }
        Delivery::Delivered
    })
}

fn fetch(
    config: &AppConfig, runtime: &tokio::runtime::Runtime, urls: &[String], force: bool, show_headers: bool,
) -> Result<()> {
    let backing: Box<dyn BackingStore> =
        if config.disc_enabled { Box::new(SqliteStore::new()) } else { Box::new(NullStore) };
    let http = HttpFetcher::new(&FetchConfig::from(config), runtime.handle().clone())?;
    let router = SchemeRouter::new().with(http).with(DataFetcher::new());
    let mut cache = Cache::initialise(config.cache_params(), Box::new(router), backing);

    let mut flags = RetrieveFlags::VERIFIABLE;
    if force {
        flags.insert(RetrieveFlags::FORCE_FETCH);
    }

    let mut pages = Vec::with_capacity(urls.len());
    for input in urls {
        let page = Rc::new(RefCell::new(Page::default()));
        let handle = canonicalize(input)
            .map_err(rescache_core::Error::from)
            .and_then(|url| cache.retrieve(&url, flags, None, None, page_callback(Rc::clone(&page), show_headers)));
        match handle {
            Ok(handle) => pages.push((input, page, Some(handle))),
            Err(e) => {
                {
                    let mut page = page.borrow_mut();
                    page.error = Some(e.to_string());
                    page.done = true;
                }
                pages.push((input, page, None));
            }
        }
    }

    while pages.iter().any(|(_, page, _)| !page.borrow().done) {
        cache.poll();
        let wait = cache.next_deadline_ms().unwrap_or(IDLE_POLL_MS).min(IDLE_POLL_MS);
        if wait > 0 {
            std::thread::sleep(Duration::from_millis(wait));
        }
    }

    let mut stdout = std::io::stdout().lock();
    let mut failed = 0;
    for (input, page, handle) in &pages {
        let page = page.borrow();
        if let Some(error) = &page.error {
            tracing::error!(url = %input, %error, "retrieval failed");
            failed += 1;
            continue;
        }
        if pages.len() > 1 {
            writeln!(stdout, "==> {input} <==")?;
        }
        for line in &page.headers {
            writeln!(stdout, "{line}")?;
        }
        if show_headers {
            writeln!(stdout)?;
        }
        stdout.write_all(&page.body)?;
        if let Some(handle) = handle {
            tracing::debug!(
                url = %input,
                lifetime = cache.remaining_lifetime(*handle).unwrap_or_default(),
                "retrieved"
            );
        }
    }
    stdout.flush()?;

    for handle in pages.iter().filter_map(|(_, _, handle)| *handle) {
        cache.release(handle).context("failed to release handle")?;
    }
    cache.finalise();

    if failed > 0 {
        bail!("{failed} of {} retrievals failed", pages.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let config = AppConfig::load().context("failed to load configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match cli.command {
        Command::Fetch { urls, force, headers } => fetch(&config, &runtime, &urls, force, headers),
    }
}
