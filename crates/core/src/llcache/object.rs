//! Cache objects and their per-object fetch context.

use url::Url;

use super::HandleId;
use super::cache_control::CacheControl;
use super::event::RetrieveFlags;
use super::headers::{Header, split_header};
use crate::transport::{CertChain, FetchId, PostData};

/// Identifier of a cache object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u64);

/// Progress of an object's fetch, and of each handle's view of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FetchState {
    #[default]
    Init,
    Headers,
    Data,
    Complete,
}

/// Where an object's source bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreState {
    #[default]
    Ram,
    Disc,
}

/// Per-object fetch parameters and retry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    pub flags: RetrieveFlags,
    pub referer: Option<Url>,
    pub post: Option<PostData>,
    pub state: FetchState,
    pub redirect_count: u32,
    pub retries_remaining: u32,
    pub hsts_in_use: bool,
    pub tried_with_auth: bool,
    pub auth_realm: Option<String>,
    pub tried_with_tls_downgrade: bool,
    pub tainted_tls: bool,
    /// The in-flight transport fetch, if any.
    pub handle: Option<FetchId>,
    /// A terminal error was reported for the current fetch.
    pub failed: bool,
}

/// Shared fetched content plus its metadata.
#[derive(Debug, Clone)]
pub struct CacheObject {
    pub url: Url,
    /// Source bytes; `None` when only the backing store has them.
    pub source: Option<Vec<u8>>,
    pub source_len: usize,
    pub store_state: StoreState,
    pub cache: CacheControl,
    pub fetch: FetchContext,
    pub headers: Vec<Header>,
    pub cert_chain: Option<CertChain>,
    /// Stale object this one is revalidating against.
    pub candidate: Option<ObjectId>,
    /// Number of objects revalidating against this one.
    pub candidate_count: u32,
    /// Handles on this object, most recent first.
    pub users: Vec<HandleId>,
    pub last_used: i64,
}

impl CacheObject {
    pub fn new(url: Url, now: i64) -> Self {
        Self {
            url,
            source: None,
            source_len: 0,
            store_state: StoreState::Ram,
            cache: CacheControl::default(),
            fetch: FetchContext::default(),
            headers: Vec::new(),
            cert_chain: None,
            candidate: None,
            candidate_count: 0,
            users: Vec::new(),
            last_used: now,
        }
    }

    /// Process one response header line.
    ///
    /// A status line (`HTTP/...`) restarts header and cache-control
    /// accumulation but keeps the request time.
    pub fn process_header(&mut self, line: &str, now: i64) {
        if line.starts_with("HTTP/") {
            let req_time = self.cache.req_time;
            self.cache.invalidate();
            self.cache.req_time = req_time;
            self.headers.clear();
        }

        if self.cache.res_time == 0 {
            self.cache.res_time = now;
        }

        let Some(header) = split_header(line) else {
            return;
        };
        self.cache.apply_header(&header.name, &header.value);
        self.headers.push(header);
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.name.eq_ignore_ascii_case(name)).map(|h| h.value.as_str())
    }

    /// Whether the object is usable without revalidation at `now`.
    pub fn is_fresh(&self, now: i64) -> bool {
        self.cache.no_cache == super::cache_control::Validate::Fresh
            && (self.cache.remaining_lifetime(now) > 0 || self.fetch.state != FetchState::Complete)
    }

    /// No handles, no revalidators and no fetch in flight.
    pub fn is_unreferenced(&self) -> bool {
        self.users.is_empty() && self.candidate_count == 0 && self.fetch.handle.is_none()
    }

    /// Approximate RAM held by the object.
    pub fn total_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.url.as_str().len()
            + self.source.as_ref().map_or(0, |_| self.source_len)
            + self.headers.iter().map(Header::size).sum::<usize>()
            + self.cert_chain.as_ref().map_or(0, CertChain::size)
    }

    /// A complete, uncacheable copy holding this object's content.
    ///
    /// The copy has no handles, no fetch and no candidate link.
    pub fn snapshot(&self, now: i64) -> Self {
        let mut copy = Self::new(self.url.clone(), now);
        copy.source = self.source.clone();
        copy.source_len = if copy.source.is_some() { self.source_len } else { 0 };
        copy.headers = self.headers.clone();
        copy.cert_chain = self.cert_chain.clone();
        copy.fetch.state = FetchState::Complete;
        copy
    }
}
