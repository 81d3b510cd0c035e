//! Fetch transports for the cache.
//!
//! ### HTTP(S)
//! - Requests run as tasks on a tokio runtime; their lifecycle messages are
//!   queued on a channel and drained by [`Fetcher::poll`].
//! - Redirects are never followed here. A 3xx with `Location` is reported as
//!   [`FetchMsg::Redirect`] and the cache decides whether to follow it.
//! - 304, 401, timeouts, certificate and TLS failures are discrete messages.
//! - Downgraded fetches use a client capped at TLS 1.2.
//!
//! ### Other schemes
//! - `data:` URLs are decoded in-process by [`DataFetcher`].
//! - [`SchemeRouter`] combines transports behind one [`Fetcher`].

pub mod data;
pub mod router;
pub mod url;

use std::collections::HashMap;
use std::time::Duration;

use reqwest::tls::{TlsInfo, Version};
use reqwest::{Client, RequestBuilder, Response, header, multipart, redirect};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use data::{DataFetcher, DataUrl, decode_data_url};
pub use router::SchemeRouter;
pub use url::{UrlError, canonicalize};

use rescache_core::config::AppConfig;
use rescache_core::llcache::split_header;
use rescache_core::{CertChain, CertError, Certificate, Error, FetchId, FetchMsg, FetchRequest, Fetcher, PostData};

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "rescache/0.1")
    pub user_agent: String,

    /// Request timeout (default: 20s)
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { user_agent: "rescache/0.1".to_string(), timeout: Duration::from_millis(20000) }
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self { user_agent: config.user_agent.clone(), timeout: config.timeout() }
    }
}

/// Whether a message is the last one a transport sends for its fetch.
pub(crate) fn ends_fetch(msg: &FetchMsg) -> bool {
    matches!(
        msg,
        FetchMsg::Finished
            | FetchMsg::TimedOut
            | FetchMsg::Error(_)
            | FetchMsg::CertErr
            | FetchMsg::SslErr
            | FetchMsg::Redirect(_)
            | FetchMsg::NotModified
            | FetchMsg::Auth { .. }
    )
}

/// Status code from an `HTTP/x.y code reason` line.
fn status_code(line: &str) -> Option<u16> {
    line.strip_prefix("HTTP/")?.split_whitespace().nth(1)?.parse().ok()
}

/// Realm named by a `WWW-Authenticate` challenge.
fn parse_realm(challenge: &str) -> Option<String> {
    let start = challenge.to_ascii_lowercase().find("realm=")? + "realm=".len();
    let rest = &challenge[start..];
    let realm = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or_default(),
        None => rest.split([',', ' ', '\t']).next().unwrap_or_default(),
    };
    Some(realm.to_string())
}

/// Map a transport failure description onto a lifecycle message.
fn classify_failure(timed_out: bool, detail: String) -> FetchMsg {
    let lower = detail.to_ascii_lowercase();
    if timed_out {
        FetchMsg::TimedOut
    } else if lower.contains("certificate") {
        FetchMsg::CertErr
    } else if lower.contains("tls") || lower.contains("ssl") || lower.contains("handshake") {
        FetchMsg::SslErr
    } else {
        FetchMsg::Error(detail)
    }
}

fn classify(err: &reqwest::Error) -> FetchMsg {
    let mut detail = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    classify_failure(err.is_timeout(), detail)
}

/// Sending half of one fetch's message queue.
struct Outbox {
    id: FetchId,
    tx: mpsc::UnboundedSender<(FetchId, FetchMsg)>,
}

impl Outbox {
    fn send(&self, msg: FetchMsg) {
        // The receiver only goes away with the transport itself.
        let _ = self.tx.send((self.id, msg));
    }
}

fn build_client(config: &FetchConfig, downgrade: bool) -> Result<Client, Error> {
    let mut builder = Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.timeout)
        .redirect(redirect::Policy::none())
        .use_rustls_tls()
        .tls_info(true)
        .gzip(true)
        .brotli(true)
        .deflate(true);
    if downgrade {
        builder = builder.max_tls_version(Version::TLS_1_2);
    }
    builder.build().map_err(|e| Error::FetchStart(format!("failed to build HTTP client: {e}")))
}

fn build_request(client: &Client, request: &FetchRequest) -> RequestBuilder {
    let url = request.url.as_str();
    let mut builder = match &request.post {
        None => client.get(url),
        Some(PostData::UrlEncoded(body)) => client
            .post(url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body.clone()),
        Some(PostData::Multipart(fields)) => {
            let form = fields
                .iter()
                .fold(multipart::Form::new(), |form, f| form.text(f.name.clone(), f.value.clone()));
            client.post(url).multipart(form)
        }
    };

    if let Some(referer) = &request.referer {
        builder = builder.header(header::REFERER, referer.as_str());
    }
    for line in &request.headers {
        if let Some(h) = split_header(line) {
            builder = builder.header(h.name, h.value);
        }
    }
    builder
}

fn header_value(response: &Response, name: &header::HeaderName) -> Option<String> {
    response.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn run_fetch(client: Client, request: FetchRequest, outbox: Outbox) {
    if let Some(host) = request.url.host_str() {
        outbox.send(FetchMsg::Progress(format!("Fetching {host}")));
    }

    let mut response = match build_request(&client, &request).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(url = %request.url, error = %e, "request failed");
            outbox.send(classify(&e));
            return;
        }
    };

    if let Some(der) = response.extensions().get::<TlsInfo>().and_then(|info| info.peer_certificate()) {
        let leaf = Certificate { err: CertError::Ok, der: der.to_vec() };
        outbox.send(FetchMsg::Certs(CertChain::new(vec![leaf])));
    }

    let status = response.status();
    outbox.send(FetchMsg::Header(format!("{:?} {}", response.version(), status)));
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            outbox.send(FetchMsg::Header(format!("{name}: {value}")));
        }
    }

    if status == reqwest::StatusCode::NOT_MODIFIED {
        outbox.send(FetchMsg::NotModified);
        return;
    }
    if status.is_redirection()
        && let Some(location) = header_value(&response, &header::LOCATION)
    {
        outbox.send(FetchMsg::Redirect(location));
        return;
    }
    if status == reqwest::StatusCode::UNAUTHORIZED {
        let realm = header_value(&response, &header::WWW_AUTHENTICATE).and_then(|c| parse_realm(&c));
        outbox.send(FetchMsg::Auth { realm });
        return;
    }
    if request.only_2xx && !status.is_success() {
        outbox.send(FetchMsg::Error(format!("HTTP status {}", status.as_u16())));
        return;
    }

    let mut received = 0usize;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                received += chunk.len();
                outbox.send(FetchMsg::Data(chunk));
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "body read failed");
                outbox.send(classify(&e));
                return;
            }
        }
    }
    tracing::debug!(url = %request.url, status = status.as_u16(), bytes = received, "fetch finished");
    outbox.send(FetchMsg::Finished);
}

/// HTTP(S) transport backed by `reqwest`.
pub struct HttpFetcher {
    client: Client,
    downgraded: Client,
    runtime: Handle,
    tx: mpsc::UnboundedSender<(FetchId, FetchMsg)>,
    rx: mpsc::UnboundedReceiver<(FetchId, FetchMsg)>,
    next_id: u64,
    tasks: HashMap<FetchId, JoinHandle<()>>,
    codes: HashMap<FetchId, u16>,
    /// Fetches that ended during the last poll; their codes are kept until
    /// the next so the cache can still read them.
    retired: Vec<FetchId>,
}

impl HttpFetcher {
    /// Create a transport whose requests run on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FetchStart`] if an HTTP client cannot be built.
    pub fn new(config: &FetchConfig, runtime: Handle) -> Result<Self, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            client: build_client(config, false)?,
            downgraded: build_client(config, true)?,
            runtime,
            tx,
            rx,
            next_id: 0,
            tasks: HashMap::new(),
            codes: HashMap::new(),
            retired: Vec::new(),
        })
    }

    /// Number of fetches still running.
    pub fn active(&self) -> usize {
        self.tasks.len()
    }
}

impl Fetcher for HttpFetcher {
    fn can_fetch(&self, url: &::url::Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn start(&mut self, request: FetchRequest) -> Result<FetchId, Error> {
        if !self.can_fetch(&request.url) {
            return Err(Error::FetchStart(request.url.to_string()));
        }
        self.next_id += 1;
        let id = FetchId(self.next_id);
        tracing::debug!(?id, url = %request.url, downgrade = request.downgrade_tls, "starting fetch");

        let client = if request.downgrade_tls { self.downgraded.clone() } else { self.client.clone() };
        let outbox = Outbox { id, tx: self.tx.clone() };
        let task = self.runtime.spawn(run_fetch(client, request, outbox));
        self.tasks.insert(id, task);
        Ok(id)
    }

    fn abort(&mut self, id: FetchId) {
        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
        }
        self.codes.remove(&id);
    }

    fn http_code(&self, id: FetchId) -> u16 {
        self.codes.get(&id).copied().unwrap_or(0)
    }

    fn poll(&mut self) -> Vec<(FetchId, FetchMsg)> {
        for id in std::mem::take(&mut self.retired) {
            self.codes.remove(&id);
        }

        let mut out = Vec::new();
        while let Ok((id, msg)) = self.rx.try_recv() {
            // Aborted fetches may still have messages in flight.
            if !self.tasks.contains_key(&id) {
                continue;
            }
            if let FetchMsg::Header(line) = &msg
                && let Some(code) = status_code(line)
            {
                self.codes.insert(id, code);
            }
            if ends_fetch(&msg) {
                self.tasks.remove(&id);
                self.retired.push(id);
            }
            out.push((id, msg));
        }
        out
    }
}

impl Drop for HttpFetcher {
    fn drop(&mut self) {
        for task in self.tasks.values() {
            task.abort();
        }
    }
}
