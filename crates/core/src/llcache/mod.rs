//! Low-level resource cache.
//!
//! Turns a URL and fetch parameters into shared, possibly persisted content
//! and keeps every consumer handle's view of that content in step with the
//! underlying fetch. The cache is single-threaded and cooperative: transport
//! messages and timer jobs are processed from [`Cache::poll`], and consumers
//! only observe progress through their handle callbacks.
//!
//! ### Objects and handles
//! - A retrieval returns a [`HandleId`]; each handle is a user of one object.
//! - Objects live in a cached list (reusable by later retrievals) or an
//!   uncached list (forced, POST, or non-cachable schemes).
//! - A redirect or a not-modified revalidation moves handles to another
//!   object without disturbing the handles themselves.
//!
//! ### Persistence
//! - Fresh, idle objects are written to the [`BackingStore`] on a timer,
//!   throttled to a byte budget per time quantum.
//! - The cleaner demotes objects to disc before destroying them.

mod cache_control;
mod clean;
mod clock;
mod event;
mod fetch;
mod headers;
mod metadata;
mod notify;
mod object;
mod persist;
mod retrieve;
mod schedule;
mod store;
mod urldb;

#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::rc::Rc;

use url::Url;

use crate::Error;
use crate::backing::{BackingStore, StoreParams};
use crate::transport::{CertChain, FetchId, Fetcher};

pub use cache_control::{CacheControl, Validate, parse_http_date, rfc1123_date};
pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{CacheEvent, Delivery, ErrorCode, HandleCallback, RetrieveFlags, callback};
pub use headers::{Header, split_header};
pub use metadata::Metadata;
pub use object::{FetchState, ObjectId, StoreState};
pub use urldb::UrlDb;

use notify::User;
use object::CacheObject;
use schedule::{Job, Schedule};
use store::{ListKind, ObjectStore};

/// Opaque consumer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

/// Cache tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheParams {
    /// RAM budget for object data, in bytes.
    pub limit: usize,
    /// Objects must stay fresh for longer than this (seconds) to be persisted.
    pub minimum_lifetime: i64,
    /// Write bandwidth floor in bytes per second.
    pub minimum_bandwidth: u64,
    /// Write bandwidth ceiling in bytes per second.
    pub maximum_bandwidth: u64,
    /// Persistence time slot in milliseconds.
    pub time_quantum: u64,
    /// Attempts made for a fetch that times out.
    pub fetch_attempts: u32,
    /// Whether refetches carry a Referer header.
    pub send_referer: bool,
    /// Handed to [`BackingStore::initialise`].
    pub store: StoreParams,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            limit: 12 * 1024 * 1024,
            minimum_lifetime: 1800,
            minimum_bandwidth: 128 * 1024,
            maximum_bandwidth: 512 * 1024,
            time_quantum: 100,
            fetch_attempts: 1,
            send_referer: true,
            store: StoreParams::default(),
        }
    }
}

/// The low-level cache.
pub struct Cache {
    params: CacheParams,
    objects: ObjectStore,
    users: HashMap<HandleId, User>,
    fetches: HashMap<FetchId, ObjectId>,
    fetcher: Box<dyn Fetcher>,
    backing: Box<dyn BackingStore>,
    store_enabled: bool,
    urldb: UrlDb,
    clock: Rc<dyn Clock>,
    schedule: Schedule,
    all_caught_up: bool,
    total_written: u64,
    total_elapsed: u64,
    next_handle: u64,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("objects", &self.objects.len())
            .field("users", &self.users.len())
            .field("fetches", &self.fetches.len())
            .field("store_enabled", &self.store_enabled)
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Create a cache on the system clock and initialise the backing store.
    ///
    /// A backing store that fails to initialise is logged and left unused.
    pub fn initialise(params: CacheParams, fetcher: Box<dyn Fetcher>, backing: Box<dyn BackingStore>) -> Self {
        Self::initialise_with_clock(params, fetcher, backing, Rc::new(SystemClock::default()))
    }

    /// As [`Cache::initialise`], reading time from `clock`.
    pub fn initialise_with_clock(
        params: CacheParams, fetcher: Box<dyn Fetcher>, mut backing: Box<dyn BackingStore>, clock: Rc<dyn Clock>,
    ) -> Self {
        tracing::info!(limit = params.limit, "cache initialising");

        let store_enabled = match backing.initialise(&params.store) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "backing store unavailable; persistence disabled");
                false
            }
        };

        Self {
            params,
            objects: ObjectStore::default(),
            users: HashMap::new(),
            fetches: HashMap::new(),
            fetcher,
            backing,
            store_enabled,
            urldb: UrlDb::new(),
            clock,
            schedule: Schedule::default(),
            all_caught_up: true,
            total_written: 0,
            total_elapsed: 0,
            next_handle: 0,
        }
    }

    /// Persist what can be persisted, drop every object and handle, and
    /// finalise the backing store.
    pub fn finalise(mut self) {
        self.persist();
        self.schedule.cancel(Job::Persist);

        for object in self.objects.clear() {
            if let Some(handle) = object.fetch.handle {
                self.fetcher.abort(handle);
            }
        }
        self.users.clear();
        self.fetches.clear();

        if self.store_enabled
            && let Err(e) = self.backing.finalise()
        {
            tracing::warn!(error = %e, "backing store finalise failed");
        }

        let bandwidth = (self.total_written * 1000).checked_div(self.total_elapsed).unwrap_or(0);
        tracing::info!(
            written = self.total_written,
            elapsed_ms = self.total_elapsed,
            bandwidth,
            "backing store writeout summary"
        );
    }

    /// Process pending transport messages, then run the jobs that were due
    /// on entry, then clean if over the RAM budget.
    pub fn poll(&mut self) {
        for (id, msg) in self.fetcher.poll() {
            self.handle_fetch_message(id, msg);
        }

        let now = self.clock.monotonic_ms();
        for job in self.schedule.take_due(now) {
            match job {
                Job::CatchUp => self.catch_up_all_users(),
                Job::Persist => self.persist(),
                Job::SlowCheck => self.persist_slowcheck(),
            }
        }

        if self.objects.total_size() > self.params.limit {
            self.clean(false);
        }
    }

    /// Milliseconds until the next scheduled job, if any.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let now = self.clock.monotonic_ms();
        self.schedule.next_due().map(|at| at.saturating_sub(now))
    }

    /// Whether any fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        !self.fetches.is_empty()
    }

    /// HSTS and credential store.
    pub fn urldb(&self) -> &UrlDb {
        &self.urldb
    }

    pub fn urldb_mut(&mut self) -> &mut UrlDb {
        &mut self.urldb
    }

    pub fn params(&self) -> &CacheParams {
        &self.params
    }

    /// Whether the backing store is still in use.
    pub fn store_enabled(&self) -> bool {
        self.store_enabled
    }

    /// Approximate RAM held by all objects.
    pub fn total_size(&self) -> usize {
        self.objects.total_size()
    }

    /// Release a handle.
    ///
    /// A handle released from inside its own notification is removed once
    /// that notification returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is not live.
    pub fn release(&mut self, handle: HandleId) -> Result<(), Error> {
        let user = self.users.get_mut(&handle).ok_or(Error::InvalidHandle(handle.0))?;
        if user.iterator_target {
            user.queued_for_delete = true;
        } else {
            self.remove_user(handle);
        }
        Ok(())
    }

    /// A new handle on the same object, with the same callback and state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is not live.
    pub fn clone_handle(&mut self, handle: HandleId) -> Result<HandleId, Error> {
        let user = self.live_user(handle)?;
        let (object, callback, state) = (user.object, Rc::clone(&user.callback), user.state);
        let new = self.add_user(object, callback);
        if let Some(user) = self.users.get_mut(&new) {
            user.state = state;
        }
        self.users_not_caught_up();
        Ok(new)
    }

    /// Stop caring about a handle's object.
    ///
    /// The sole handle stops the fetch outright. A handle sharing its object
    /// moves to a private complete copy so the other handles are undisturbed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is not live.
    pub fn abort(&mut self, handle: HandleId) -> Result<(), Error> {
        let object_id = self.live_user(handle)?.object;
        let now = self.clock.now();
        let object = self.objects.get(object_id).ok_or(Error::InvalidHandle(handle.0))?;

        if object.users.len() > 1 {
            let snapshot = object.snapshot(now);
            let snapshot_id = self.objects.insert(snapshot, ListKind::Uncached);
            tracing::debug!(?object_id, ?snapshot_id, "aborting shared object via snapshot");
            self.move_user(handle, snapshot_id);
        } else {
            self.abort_fetch(object_id);
            if let Some(object) = self.objects.get_mut(object_id) {
                object.fetch.state = FetchState::Complete;
                object.cache.invalidate();
            }
        }
        Ok(())
    }

    /// Stop retaining delivered bytes for this handle's object.
    ///
    /// Ignored when the object has other handles, since they may need replay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is not live.
    pub fn force_stream(&mut self, handle: HandleId) -> Result<(), Error> {
        let object_id = self.live_user(handle)?.object;
        let Some(object) = self.objects.get_mut(object_id) else {
            return Err(Error::InvalidHandle(handle.0));
        };
        if object.users.len() > 1 {
            return Ok(());
        }
        object.fetch.flags.insert(RetrieveFlags::STREAM_DATA);
        self.objects.move_to(object_id, ListKind::Uncached);
        Ok(())
    }

    /// Require the object to be revalidated before it is reused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is not live.
    pub fn invalidate_cache_data(&mut self, handle: HandleId) -> Result<(), Error> {
        let object_id = self.live_user(handle)?.object;
        if let Some(object) = self.objects.get_mut(object_id)
            && object.fetch.handle.is_none()
            && object.cache.no_cache == Validate::Fresh
        {
            object.cache.no_cache = Validate::Once;
        }
        Ok(())
    }

    /// Replace a handle's callback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is not live.
    pub fn change_callback(&mut self, handle: HandleId, callback: HandleCallback) -> Result<(), Error> {
        let user = self.users.get_mut(&handle).ok_or(Error::InvalidHandle(handle.0))?;
        user.callback = callback;
        Ok(())
    }

    pub fn url(&self, handle: HandleId) -> Option<&Url> {
        self.handle_object(handle).map(|o| &o.url)
    }

    /// Source bytes retained for the handle's object.
    pub fn source_data(&self, handle: HandleId) -> Option<&[u8]> {
        self.handle_object(handle).and_then(|o| o.source.as_deref())
    }

    /// First response header named `name`, compared case-insensitively.
    pub fn header(&self, handle: HandleId, name: &str) -> Option<&str> {
        self.handle_object(handle).and_then(|o| o.header(name))
    }

    pub fn headers(&self, handle: HandleId) -> Option<&[Header]> {
        self.handle_object(handle).map(|o| o.headers.as_slice())
    }

    pub fn cert_chain(&self, handle: HandleId) -> Option<&CertChain> {
        self.handle_object(handle).and_then(|o| o.cert_chain.as_ref())
    }

    /// State of the handle's object's fetch.
    pub fn fetch_state(&self, handle: HandleId) -> Option<FetchState> {
        self.handle_object(handle).map(|o| o.fetch.state)
    }

    /// How far notifications to this handle have progressed.
    pub fn handle_state(&self, handle: HandleId) -> Option<FetchState> {
        self.users.get(&handle).map(|u| u.state)
    }

    /// Source bytes delivered to this handle so far.
    pub fn bytes_delivered(&self, handle: HandleId) -> Option<usize> {
        self.users.get(&handle).map(|u| u.bytes)
    }

    pub fn references_same_object(&self, a: HandleId, b: HandleId) -> bool {
        match (self.users.get(&a), self.users.get(&b)) {
            (Some(a), Some(b)) => a.object == b.object,
            _ => false,
        }
    }

    /// Remaining freshness lifetime of the handle's object, in seconds.
    pub fn remaining_lifetime(&self, handle: HandleId) -> Option<i64> {
        let now = self.clock.now();
        self.handle_object(handle).map(|o| o.cache.remaining_lifetime(now))
    }

    fn handle_object(&self, handle: HandleId) -> Option<&CacheObject> {
        self.users.get(&handle).and_then(|u| self.objects.get(u.object))
    }

    fn live_user(&self, handle: HandleId) -> Result<&User, Error> {
        self.users.get(&handle).filter(|u| !u.queued_for_delete).ok_or(Error::InvalidHandle(handle.0))
    }

    /// Abort and forget the object's transport fetch.
    fn abort_fetch(&mut self, id: ObjectId) {
        if let Some(handle) = self.detach_fetch(id) {
            self.fetcher.abort(handle);
        }
    }

    /// Forget the object's transport fetch without aborting it.
    fn detach_fetch(&mut self, id: ObjectId) -> Option<FetchId> {
        let handle = self.objects.get_mut(id)?.fetch.handle.take()?;
        self.fetches.remove(&handle);
        Some(handle)
    }

    /// Drop the object's revalidation link, if any.
    fn release_candidate(&mut self, id: ObjectId) {
        let Some(candidate) = self.objects.get_mut(id).and_then(|o| o.candidate.take()) else {
            return;
        };
        if let Some(candidate) = self.objects.get_mut(candidate) {
            candidate.candidate_count = candidate.candidate_count.saturating_sub(1);
        }
    }

    /// Remove an object from the store, tearing down its fetch and links.
    fn destroy_object(&mut self, id: ObjectId) {
        self.abort_fetch(id);
        self.release_candidate(id);
        if let Some(object) = self.objects.remove(id) {
            tracing::debug!(?id, url = %object.url, "destroyed object");
        }
    }
}
