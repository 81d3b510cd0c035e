//! Fetch driver: issues transport fetches for objects and applies the
//! resulting messages.
//!
//! Each object has at most one transport fetch. Its state moves
//! `Init -> Headers -> Data -> Complete`; redirects, authentication
//! challenges, TLS failures and timeouts either refetch the same object or
//! finish it with an error event.

use url::Url;

use super::cache_control::{Validate, rfc1123_date};
use super::event::{CacheEvent, ErrorCode, RetrieveFlags};
use super::object::{FetchState, ObjectId};
use super::schedule::Job;
use super::{Cache, HandleId};
use crate::Error;
use crate::transport::{CertChain, FetchId, FetchMsg, FetchRequest, MAX_CERT_DEPTH, PostData};

/// Redirects followed from one retrieval before giving up.
const MAX_REDIRECTS: u32 = 10;

/// Source buffers grow in steps of this many bytes.
const SOURCE_GROWTH: usize = 64 * 1024;

/// Delay before persisting after a fetch completes, in milliseconds.
const PERSIST_DELAY_MS: i64 = 5000;

/// Schemes whose objects may not redirect elsewhere.
fn is_internal_scheme(scheme: &str) -> bool {
    matches!(scheme, "file" | "about" | "resource")
}

/// Whether a referer may accompany a request for `url`: same scheme, or an
/// http referer on an https request.
fn referer_allowed(referer: &Url, url: &Url) -> bool {
    referer.scheme() == url.scheme() || (url.scheme() == "https" && referer.scheme() == "http")
}

impl Cache {
    /// Apply one transport message.
    ///
    /// Messages for fetches the cache no longer tracks are ignored.
    pub fn handle_fetch_message(&mut self, fetch: FetchId, msg: FetchMsg) {
        let Some(&id) = self.fetches.get(&fetch) else {
            tracing::debug!(?fetch, "message for unknown fetch");
            return;
        };

        let result = match msg {
            FetchMsg::Header(line) => {
                self.fetch_header(id, &line);
                Ok(())
            }
            FetchMsg::Redirect(location) => {
                self.release_candidate(id);
                self.fetch_redirect(id, &location)
            }
            FetchMsg::NotModified => self.fetch_not_modified(id),
            FetchMsg::Data(data) => self.fetch_data(id, fetch, &data),
            FetchMsg::Finished => {
                self.fetch_finished(id);
                Ok(())
            }
            FetchMsg::TimedOut => self.fetch_timed_out(id),
            FetchMsg::Error(message) => self.fetch_error(id, message),
            FetchMsg::Progress(text) => self.send_event_to_users(id, &CacheEvent::Progress(text)),
            FetchMsg::Certs(chain) => self.fetch_certs(id, chain),
            FetchMsg::Auth { realm } => {
                self.release_candidate(id);
                self.fetch_auth(id, realm)
            }
            FetchMsg::CertErr => {
                self.release_candidate(id);
                self.fetch_cert_error(id)
            }
            FetchMsg::SslErr => {
                self.release_candidate(id);
                self.fetch_ssl_error(id)
            }
        };

        if let Err(e) = result {
            self.fetch_failed(id, e);
        }
        self.users_not_caught_up();
    }

    /// Set up an object's fetch context and start fetching it.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the fetch.
    pub(super) fn start_fetch(
        &mut self, id: ObjectId, flags: RetrieveFlags, referer: Option<&Url>, post: Option<&PostData>,
        redirect_count: u32, hsts_in_use: bool,
    ) -> Result<(), Error> {
        let attempts = self.params.fetch_attempts;
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        object.fetch.flags = flags;
        object.fetch.referer = referer.cloned();
        object.fetch.post = post.cloned();
        object.fetch.redirect_count = redirect_count;
        object.fetch.retries_remaining = attempts;
        object.fetch.hsts_in_use = hsts_in_use;
        self.refetch(id)
    }

    /// Issue (or reissue) the transport fetch for an object.
    ///
    /// Conditional headers come from the object's current cache data, which
    /// is then reset.
    fn refetch(&mut self, id: ObjectId) -> Result<(), Error> {
        let now = self.clock.now();
        let Some(object) = self.objects.get(id) else {
            return Ok(());
        };

        let mut headers = Vec::new();
        if let Some(etag) = &object.cache.etag {
            headers.push(format!("If-None-Match: {etag}"));
        }
        if let Some(modified) = object.cache.last_modified
            && let Some(date) = rfc1123_date(modified)
        {
            headers.push(format!("If-Modified-Since: {date}"));
        }
        if object.fetch.tried_with_auth
            && let Some(realm) = &object.fetch.auth_realm
            && let Some(authorization) = self.urldb.authorization_header(&object.url, realm)
        {
            headers.push(authorization);
        }

        let referer = match &object.fetch.referer {
            Some(referer) if self.params.send_referer && referer_allowed(referer, &object.url) => Some(referer.clone()),
            _ => None,
        };
        let flags = object.fetch.flags;
        let request = FetchRequest {
            url: object.url.clone(),
            referer,
            only_2xx: flags.contains(RetrieveFlags::NO_ERROR_PAGES),
            post: object.fetch.post.clone(),
            verifiable: flags.contains(RetrieveFlags::VERIFIABLE),
            downgrade_tls: object.fetch.tried_with_tls_downgrade,
            headers,
        };

        self.abort_fetch(id);
        if let Some(object) = self.objects.get_mut(id) {
            object.cache.invalidate();
            object.cache.req_time = now;
            object.cache.fin_time = now;
            object.fetch.state = FetchState::Init;
            object.fetch.failed = false;
            object.source = None;
            object.source_len = 0;
        }
        self.reset_users(id);

        tracing::debug!(?id, url = %request.url, conditional = !request.headers.is_empty(), "starting fetch");
        let fetch = self.fetcher.start(request)?;
        if let Some(object) = self.objects.get_mut(id) {
            object.fetch.handle = Some(fetch);
        }
        self.fetches.insert(fetch, id);
        Ok(())
    }

    /// Finish an object with a terminal error event to its handles.
    fn fail_object(&mut self, id: ObjectId, code: ErrorCode, message: Option<String>) -> Result<(), Error> {
        if let Some(object) = self.objects.get_mut(id) {
            object.fetch.failed = true;
            object.fetch.state = FetchState::Complete;
        }
        tracing::debug!(?id, %code, message = message.as_deref().unwrap_or(""), "fetch failed");
        self.send_event_to_users(id, &CacheEvent::Error { code, message })
    }

    /// Stop an object whose message processing failed.
    ///
    /// Handles are sent an error event unless a callback was the failure.
    fn fetch_failed(&mut self, id: ObjectId, error: Error) {
        tracing::warn!(?id, error = %error, "fetch processing failed");

        let code = match error {
            Error::OutOfMemory(_) => {
                self.clean(true);
                Some(ErrorCode::OutOfMemory)
            }
            Error::Callback(_) => None,
            _ => Some(ErrorCode::Unknown),
        };

        self.abort_fetch(id);
        if let Some(object) = self.objects.get_mut(id) {
            object.cache.invalidate();
            object.fetch.state = FetchState::Complete;
            object.fetch.failed = true;
        }

        if let Some(code) = code
            && let Err(e) = self.fail_object(id, code, Some(error.to_string()))
        {
            tracing::warn!(?id, error = %e, "could not report fetch failure");
        }
    }

    fn fetch_header(&mut self, id: ObjectId, line: &str) {
        let now = self.clock.now();
        if let Some(object) = self.objects.get_mut(id) {
            if object.fetch.state < FetchState::Headers {
                object.fetch.state = FetchState::Headers;
            }
            object.process_header(line, now);
        }
    }

    fn fetch_data(&mut self, id: ObjectId, fetch: FetchId, data: &[u8]) -> Result<(), Error> {
        let code = self.fetcher.http_code(fetch);
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };

        if object.fetch.state != FetchState::Data {
            let unvalidated_query =
                object.url.query().is_some() && object.cache.max_age.is_none() && object.cache.expires.is_none();
            if !matches!(code, 200 | 203) || unvalidated_query {
                tracing::debug!(?id, code, "response not cacheable");
                object.cache.invalidate();
            }
            object.fetch.state = FetchState::Data;
            self.release_candidate(id);
        }

        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        let source = object.source.get_or_insert_with(Vec::new);
        let spare = source.capacity() - source.len();
        if spare < data.len() {
            let growth = (data.len() - spare).div_ceil(SOURCE_GROWTH) * SOURCE_GROWTH;
            source.try_reserve_exact(growth)?;
        }
        source.extend_from_slice(data);
        object.source_len = source.len();
        Ok(())
    }

    fn fetch_finished(&mut self, id: ObjectId) {
        let now = self.clock.now();
        self.detach_fetch(id);
        self.release_candidate(id);

        let Some(object) = self.objects.get_mut(id) else {
            return;
        };
        if let Some(source) = object.source.as_mut() {
            source.shrink_to_fit();
        }
        object.cache.fin_time = now;
        object.cache.update(now);
        object.fetch.state = FetchState::Complete;
        tracing::debug!(?id, url = %object.url, len = object.source_len, "fetch complete");

        self.update_hsts(id);
        self.schedule.schedule(self.clock.monotonic_ms(), PERSIST_DELAY_MS, Job::Persist);
    }

    /// Learn HSTS policy from a completed, untainted https response.
    fn update_hsts(&mut self, id: ObjectId) {
        let now = self.clock.now();
        let Some(object) = self.objects.get(id) else {
            return;
        };
        if object.url.scheme() != "https" || object.fetch.tainted_tls {
            return;
        }
        if let Some(policy) = object.header("Strict-Transport-Security") {
            self.urldb.set_hsts_policy(&object.url, policy, now);
        }
    }

    fn fetch_redirect(&mut self, id: ObjectId, location: &str) -> Result<(), Error> {
        let now = self.clock.now();
        self.update_hsts(id);

        let code = self.objects.get(id).and_then(|o| o.fetch.handle).map_or(0, |f| self.fetcher.http_code(f));
        self.abort_fetch(id);

        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        object.cache.invalidate();
        object.fetch.state = FetchState::Complete;
        let from = object.url.clone();
        let context = object.fetch.clone();

        if context.redirect_count >= MAX_REDIRECTS {
            return self.reject_redirect(id, format!("too many redirects from {from}"));
        }

        let target = match from.join(location) {
            Ok(target) => target,
            Err(e) => return self.reject_redirect(id, format!("invalid redirect target {location:?}: {e}")),
        };
        let (target, hsts_in_use) = self.urldb.transform(&target, now);

        if is_internal_scheme(from.scheme()) && target.scheme() != from.scheme() {
            return self.reject_redirect(id, format!("refusing redirect from {from} to {target}"));
        }
        if !self.fetcher.can_fetch(&target) {
            return self.reject_redirect(id, format!("no fetcher for {target}"));
        }

        let post = match code {
            301..=303 => None,
            307 => context.post.clone(),
            _ if context.post.is_none() => None,
            _ => return self.reject_redirect(id, format!("cannot redirect POST with status {code}")),
        };

        tracing::debug!(?id, %from, to = %target, code, "following redirect");
        self.send_event_to_users(id, &CacheEvent::Redirect { from, to: target.clone() })?;

        let dest = match self.retrieve_object(
            &target,
            context.flags,
            context.referer.as_ref(),
            post.as_ref(),
            context.redirect_count + 1,
            hsts_in_use,
        ) {
            Ok(dest) => dest,
            Err(e) => return self.reject_redirect(id, e.to_string()),
        };

        let users: Vec<HandleId> = self.objects.get(id).map(|o| o.users.clone()).unwrap_or_default();
        for handle in users {
            self.move_user_reset(handle, dest);
        }
        Ok(())
    }

    fn reject_redirect(&mut self, id: ObjectId, reason: String) -> Result<(), Error> {
        tracing::debug!(?id, reason, "redirect rejected");
        self.fail_object(id, ErrorCode::BadRedirect, Some(reason))
    }

    fn fetch_not_modified(&mut self, id: ObjectId) -> Result<(), Error> {
        let now = self.clock.now();
        let candidate = self.objects.get(id).and_then(|o| o.candidate);

        if let Some(candidate) = candidate
            && self.objects.get(candidate).is_some()
        {
            let users: Vec<HandleId> = self.objects.get(id).map(|o| o.users.clone()).unwrap_or_default();
            for handle in users {
                self.move_user_reset(handle, candidate);
            }

            let mut fresh = self.objects.get_mut(id).map(|o| std::mem::take(&mut o.cache)).unwrap_or_default();
            if let Some(stale) = self.objects.get_mut(candidate) {
                fresh.copy_into(&mut stale.cache, false);
                stale.cache.update(now);
                if stale.cache.no_cache == Validate::Once {
                    stale.cache.no_cache = Validate::Fresh;
                }
                stale.fetch.state = FetchState::Complete;
                stale.candidate_count = stale.candidate_count.saturating_sub(1);
                tracing::debug!(?id, ?candidate, url = %stale.url, "revalidated");
            }
            if let Some(object) = self.objects.get_mut(id) {
                object.cache = fresh;
                object.candidate = None;
            }
        }

        self.abort_fetch(id);
        if let Some(object) = self.objects.get_mut(id) {
            object.cache.invalidate();
            object.fetch.state = FetchState::Complete;
        }
        self.update_hsts(id);
        Ok(())
    }

    fn fetch_auth(&mut self, id: ObjectId, realm: Option<String>) -> Result<(), Error> {
        self.abort_fetch(id);
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        object.cache.invalidate();
        object.headers.clear();

        let realm = realm.unwrap_or_else(|| object.url.to_string());
        if self.urldb.auth(&object.url, &realm).is_none() || object.fetch.tried_with_auth {
            object.fetch.tried_with_auth = false;
            return self.fail_object(id, ErrorCode::BadAuth, Some(realm));
        }

        object.fetch.tried_with_auth = true;
        object.fetch.auth_realm = Some(realm);
        self.refetch(id)
    }

    fn fetch_cert_error(&mut self, id: ObjectId) -> Result<(), Error> {
        self.detach_fetch(id);
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        object.cache.invalidate();
        object.fetch.tainted_tls = true;

        let code = if object.fetch.hsts_in_use { ErrorCode::Unknown } else { ErrorCode::BadCerts };
        self.fail_object(id, code, None)
    }

    fn fetch_ssl_error(&mut self, id: ObjectId) -> Result<(), Error> {
        self.detach_fetch(id);
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        object.cache.invalidate();
        object.fetch.tainted_tls = true;

        if object.fetch.hsts_in_use || object.fetch.tried_with_tls_downgrade {
            return self.fail_object(id, ErrorCode::Unknown, Some("TLS connection setup failed".to_string()));
        }
        object.fetch.tried_with_tls_downgrade = true;
        tracing::debug!(?id, url = %object.url, "retrying with TLS downgrade");
        self.refetch(id)
    }

    fn fetch_timed_out(&mut self, id: ObjectId) -> Result<(), Error> {
        self.detach_fetch(id);
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };

        if object.fetch.retries_remaining > 1 {
            object.fetch.retries_remaining -= 1;
            tracing::debug!(?id, remaining = object.fetch.retries_remaining, "fetch timed out; retrying");
            return self.refetch(id);
        }

        object.cache.invalidate();
        self.release_candidate(id);
        self.fail_object(id, ErrorCode::Timeout, None)
    }

    fn fetch_error(&mut self, id: ObjectId, message: String) -> Result<(), Error> {
        self.detach_fetch(id);
        self.release_candidate(id);
        if let Some(object) = self.objects.get_mut(id) {
            object.cache.invalidate();
        }
        self.fail_object(id, ErrorCode::Unknown, Some(message))
    }

    fn fetch_certs(&mut self, id: ObjectId, mut chain: CertChain) -> Result<(), Error> {
        chain.certs.truncate(MAX_CERT_DEPTH);
        let Some(object) = self.objects.get_mut(id) else {
            return Ok(());
        };
        object.cert_chain = Some(chain.clone());
        self.send_event_to_notified(id, &CacheEvent::GotCerts(chain))
    }
}
