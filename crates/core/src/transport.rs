//! Fetch transport contract.
//!
//! The cache never talks to the network itself. It starts fetches through a
//! [`Fetcher`] and is fed the resulting lifecycle messages, either by
//! [`crate::llcache::Cache::poll`] draining [`Fetcher::poll`] or by a host
//! calling [`crate::llcache::Cache::handle_fetch_message`] directly.

use bytes::Bytes;
use url::Url;

use crate::Error;

/// Maximum depth of a certificate chain accepted from a transport or store.
pub const MAX_CERT_DEPTH: usize = 10;

/// Identifier of one in-flight fetch, unique per transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchId(pub u64);

/// A single multipart form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartField {
    pub name: String,
    pub value: String,
}

/// Body of a POST request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostData {
    /// `application/x-www-form-urlencoded` body.
    UrlEncoded(String),
    /// `multipart/form-data` fields.
    Multipart(Vec<MultipartField>),
}

/// Everything a transport needs to issue a request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub referer: Option<Url>,
    /// Report non-2xx responses as errors rather than delivering error pages.
    pub only_2xx: bool,
    pub post: Option<PostData>,
    /// Certificate verification must not be bypassed.
    pub verifiable: bool,
    /// Retry the TLS handshake with a lowered protocol ceiling.
    pub downgrade_tls: bool,
    /// Extra request headers as `Name: value` lines.
    pub headers: Vec<String>,
}

/// Verification status of a certificate in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertError {
    #[default]
    Ok,
    Unknown,
    BadIssuer,
    BadSignature,
    TooYoung,
    Expired,
    SelfSigned,
    ChainSelfSigned,
    Revoked,
    HostnameMismatch,
    CertMissing,
}

impl CertError {
    const ALL: [CertError; 11] = [
        CertError::Ok,
        CertError::Unknown,
        CertError::BadIssuer,
        CertError::BadSignature,
        CertError::TooYoung,
        CertError::Expired,
        CertError::SelfSigned,
        CertError::ChainSelfSigned,
        CertError::Revoked,
        CertError::HostnameMismatch,
        CertError::CertMissing,
    ];

    /// Numeric code used in serialised metadata.
    pub fn code(self) -> i32 {
        Self::ALL.iter().position(|e| *e == self).map(|p| p as i32).unwrap_or(1)
    }

    /// Decode a numeric code; anything outside the known range is `Unknown`.
    pub fn from_code(code: i32) -> Self {
        usize::try_from(code).ok().and_then(|c| Self::ALL.get(c).copied()).unwrap_or(CertError::Unknown)
    }
}

/// One DER certificate and its verification status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Certificate {
    pub err: CertError,
    pub der: Vec<u8>,
}

/// Certificate chain as reported by a TLS transport, leaf first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CertChain {
    pub certs: Vec<Certificate>,
}

impl CertChain {
    pub fn new(certs: Vec<Certificate>) -> Self {
        Self { certs }
    }

    pub fn depth(&self) -> usize {
        self.certs.len()
    }

    /// Approximate heap footprint, for cache accounting.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.certs.iter().map(|c| std::mem::size_of::<Certificate>() + c.der.len()).sum::<usize>()
    }
}

/// Lifecycle message emitted by a transport for one fetch.
#[derive(Debug, Clone)]
pub enum FetchMsg {
    /// One response header line, including the `HTTP/x.y code reason` status line.
    Header(String),
    /// 3xx response; the payload is the (possibly relative) `Location`.
    Redirect(String),
    /// 304 response to a conditional request.
    NotModified,
    /// A chunk of body bytes.
    Data(Bytes),
    /// The body is complete.
    Finished,
    /// The request timed out. The transport has already cleaned up.
    TimedOut,
    /// The request failed. The transport has already cleaned up.
    Error(String),
    /// Human-readable progress text.
    Progress(String),
    /// Certificate chain of the TLS connection.
    Certs(CertChain),
    /// 401 response; the realm from `WWW-Authenticate`, if any.
    Auth { realm: Option<String> },
    /// Certificate verification failed. The transport has already cleaned up.
    CertErr,
    /// TLS connection setup failed. The transport has already cleaned up.
    SslErr,
}

/// A source of fetches for the cache.
pub trait Fetcher {
    /// Whether this transport can fetch `url` at all.
    fn can_fetch(&self, url: &Url) -> bool;

    /// Start a fetch. Messages for it arrive through [`Fetcher::poll`].
    fn start(&mut self, request: FetchRequest) -> Result<FetchId, Error>;

    /// Stop a fetch; no further messages are delivered for it.
    fn abort(&mut self, id: FetchId);

    /// HTTP status of the fetch, or 0 when no status line has been seen.
    fn http_code(&self, id: FetchId) -> u16;

    /// Drain messages produced since the last call, in arrival order.
    fn poll(&mut self) -> Vec<(FetchId, FetchMsg)>;
}
