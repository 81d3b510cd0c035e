//! Events delivered to cache consumers and their replies.

use std::cell::RefCell;
use std::ops::BitOr;
use std::rc::Rc;

use bytes::Bytes;
use url::Url;

use super::{Cache, HandleId};
use crate::transport::CertChain;

/// Retrieval flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RetrieveFlags(u32);

impl RetrieveFlags {
    pub const NONE: Self = Self(0);
    /// Bypass the cache entirely.
    pub const FORCE_FETCH: Self = Self(1 << 0);
    /// Certificate verification must not be bypassed.
    pub const VERIFIABLE: Self = Self(1 << 1);
    /// Report non-2xx responses as errors.
    pub const NO_ERROR_PAGES: Self = Self(1 << 2);
    /// Do not retain delivered bytes; disables replay.
    pub const STREAM_DATA: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for RetrieveFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Terminal failure classes reported through [`CacheEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRedirect,
    BadAuth,
    BadCerts,
    Timeout,
    OutOfMemory,
    Unknown,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ErrorCode::BadRedirect => "BAD_REDIRECT",
            ErrorCode::BadAuth => "BAD_AUTH",
            ErrorCode::BadCerts => "BAD_CERTS",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::OutOfMemory => "NOMEM",
            ErrorCode::Unknown => "UNKNOWN",
        };
        f.write_str(code)
    }
}

/// An event delivered to a handle's callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// Certificate chain of the connection the object came over.
    GotCerts(CertChain),
    /// All response headers are available.
    HadHeaders,
    /// Source bytes not yet delivered to this handle.
    HadData(Bytes),
    /// The object is complete.
    Done,
    /// The fetch failed terminally.
    Error { code: ErrorCode, message: Option<String> },
    /// Transport progress text.
    Progress(String),
    /// The object was redirected; the handle will follow.
    Redirect { from: Url, to: Url },
}

/// A callback's reply to an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The event was consumed.
    Delivered,
    /// Not ready; deliver the event again on a later pass.
    Replay,
    /// The consumer failed; the object's fetch is stopped.
    Error(String),
}

/// Consumer callback bound to a handle.
///
/// The callback receives the cache itself so it may retrieve, clone or
/// release handles (including its own) while being notified.
pub type HandleCallback = Rc<RefCell<dyn FnMut(&mut Cache, HandleId, &CacheEvent) -> Delivery>>;

/// Box a closure as a [`HandleCallback`].
pub fn callback<F>(f: F) -> HandleCallback
where
    F: FnMut(&mut Cache, HandleId, &CacheEvent) -> Delivery + 'static,
{
    Rc::new(RefCell::new(f))
}
