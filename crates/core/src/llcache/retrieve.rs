//! Retrieval: mapping a request onto a new or existing object.

use url::Url;

use super::event::{HandleCallback, RetrieveFlags};
use super::metadata;
use super::object::{CacheObject, FetchState, ObjectId, StoreState};
use super::store::ListKind;
use super::{Cache, HandleId};
use crate::Error;
use crate::backing::StoreFlags;
use crate::transport::PostData;

/// Schemes whose responses may be reused by later retrievals.
const CACHEABLE_SCHEMES: &[&str] = &["http", "https", "data", "resource", "file"];

impl Cache {
    /// Retrieve a URL, returning a handle whose callback will be told of
    /// the object's progress.
    ///
    /// `http:` URLs under an HSTS policy are fetched over https. A fresh
    /// cached object is shared; a stale one is revalidated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFetchHandler`] if no transport can fetch the URL,
    /// or the transport's error if the fetch cannot be started.
    pub fn retrieve(
        &mut self, url: &Url, flags: RetrieveFlags, referer: Option<&Url>, post: Option<&PostData>,
        callback: HandleCallback,
    ) -> Result<HandleId, Error> {
        let now = self.clock.now();
        let (url, hsts_in_use) = self.urldb.transform(url, now);
        if !self.fetcher.can_fetch(&url) {
            return Err(Error::NoFetchHandler(url.to_string()));
        }

        let object = self.retrieve_object(&url, flags, referer, post, 0, hsts_in_use)?;
        if let Some(obj) = self.objects.get_mut(object) {
            obj.last_used = now;
        }
        let handle = self.add_user(object, callback);
        tracing::debug!(?handle, ?object, %url, "retrieved");

        self.users_not_caught_up();
        Ok(handle)
    }

    /// Find or create the object for a request, starting a fetch if needed.
    pub(super) fn retrieve_object(
        &mut self, url: &Url, flags: RetrieveFlags, referer: Option<&Url>, post: Option<&PostData>,
        redirect_count: u32, hsts_in_use: bool,
    ) -> Result<ObjectId, Error> {
        let mut url = url.clone();
        url.set_fragment(None);

        let uncachable = flags.contains(RetrieveFlags::FORCE_FETCH)
            || flags.contains(RetrieveFlags::STREAM_DATA)
            || post.is_some()
            || !CACHEABLE_SCHEMES.contains(&url.scheme());

        if uncachable {
            let id = self.objects.insert(CacheObject::new(url, self.clock.now()), ListKind::Uncached);
            tracing::debug!(?id, "uncachable retrieval");
            self.fetch_new(id, flags, referer, post, redirect_count, hsts_in_use)?;
            return Ok(id);
        }

        self.retrieve_from_cache(&url, flags, referer, redirect_count, hsts_in_use)
    }

    fn retrieve_from_cache(
        &mut self, url: &Url, flags: RetrieveFlags, referer: Option<&Url>, redirect_count: u32, hsts_in_use: bool,
    ) -> Result<ObjectId, Error> {
        let now = self.clock.now();
        let found = match self.objects.find_newest(url) {
            Some(id) => Some(id),
            None => self.fetch_persistent(url),
        };

        if let Some(id) = found {
            let fresh = self.objects.get(id).is_some_and(|o| o.is_fresh(now));
            match self.page_in(id) {
                Ok(()) if fresh => {
                    tracing::debug!(?id, %url, "cache hit");
                    return Ok(id);
                }
                Ok(()) => return self.revalidate(id, url, flags, referer, redirect_count, hsts_in_use),
                Err(e) => {
                    tracing::debug!(?id, error = %e, "could not page in object");
                    self.discard(id);
                }
            }
        }

        tracing::debug!(%url, "cache miss");
        let id = self.objects.insert(CacheObject::new(url.clone(), now), ListKind::Cached);
        self.fetch_new(id, flags, referer, None, redirect_count, hsts_in_use)?;
        Ok(id)
    }

    /// Start a conditional fetch for a stale object through a new object
    /// linked to it as candidate.
    fn revalidate(
        &mut self, stale: ObjectId, url: &Url, flags: RetrieveFlags, referer: Option<&Url>, redirect_count: u32,
        hsts_in_use: bool,
    ) -> Result<ObjectId, Error> {
        let mut object = CacheObject::new(url.clone(), self.clock.now());
        if let Some(old) = self.objects.get_mut(stale) {
            old.cache.copy_into(&mut object.cache, true);
            old.candidate_count += 1;
        }
        object.candidate = Some(stale);

        let id = self.objects.insert(object, ListKind::Cached);
        tracing::debug!(?id, candidate = ?stale, %url, "revalidating stale object");
        self.fetch_new(id, flags, referer, None, redirect_count, hsts_in_use)?;
        Ok(id)
    }

    /// Start a new object's fetch, destroying the object if it cannot start.
    fn fetch_new(
        &mut self, id: ObjectId, flags: RetrieveFlags, referer: Option<&Url>, post: Option<&PostData>,
        redirect_count: u32, hsts_in_use: bool,
    ) -> Result<(), Error> {
        if let Err(e) = self.start_fetch(id, flags, referer, post, redirect_count, hsts_in_use) {
            self.destroy_object(id);
            return Err(e);
        }
        Ok(())
    }

    /// Destroy an object that could not be reused, or take it out of the
    /// cached list if something still refers to it.
    fn discard(&mut self, id: ObjectId) {
        if self.objects.get(id).is_some_and(|o| o.is_unreferenced()) {
            self.destroy_object(id);
        } else {
            self.objects.move_to(id, ListKind::Uncached);
        }
    }

    /// Bring a disc-only object's source back into RAM.
    fn page_in(&mut self, id: ObjectId) -> Result<(), Error> {
        let Some(object) = self.objects.get(id) else {
            return Err(Error::NotFound(format!("{id:?}")));
        };
        if object.source.is_some() || object.store_state != StoreState::Disc {
            return Ok(());
        }
        if !self.store_enabled {
            return Err(Error::BackingStore("backing store disabled".to_string()));
        }

        let url = object.url.clone();
        let expected = object.source_len;
        let data = self.backing.fetch(&url, StoreFlags::None)?;
        if let Err(e) = self.backing.release(&url, StoreFlags::None) {
            tracing::debug!(%url, error = %e, "backing store release failed");
        }
        if data.len() != expected {
            return Err(Error::BackingStore(format!("stored {} bytes for {url}, expected {expected}", data.len())));
        }

        if let Some(object) = self.objects.get_mut(id) {
            object.source = Some(data);
        }
        Ok(())
    }

    /// Build a disc-only object from stored metadata.
    ///
    /// Missing or unusable metadata is a miss, never an error.
    fn fetch_persistent(&mut self, url: &Url) -> Option<ObjectId> {
        if !matches!(url.scheme(), "http" | "https") || !self.store_enabled {
            return None;
        }
        let now = self.clock.now();

        let data = match self.backing.fetch(url, StoreFlags::Meta) {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return None,
            Err(e) => {
                tracing::debug!(%url, error = %e, "metadata fetch failed");
                return None;
            }
        };
        let parsed = metadata::deserialise(&data, url);
        if let Err(e) = self.backing.release(url, StoreFlags::Meta) {
            tracing::debug!(%url, error = %e, "backing store release failed");
        }

        let meta = match parsed {
            Ok(meta) => meta,
            Err(e @ Error::MetadataUrlMismatch { .. }) => {
                tracing::warn!(%url, error = %e, "backing store key collision");
                return None;
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "discarding malformed metadata");
                return None;
            }
        };

        let mut object = CacheObject::new(url.clone(), now);
        object.cache.req_time = now;
        object.cache.fin_time = now;
        for line in &meta.headers {
            object.process_header(line, now);
        }
        object.source_len = meta.source_len;
        object.cache.req_time = meta.req_time;
        object.cache.res_time = meta.res_time;
        object.cache.fin_time = meta.fin_time;
        object.cert_chain = meta.cert_chain;
        object.store_state = StoreState::Disc;
        object.fetch.state = FetchState::Complete;

        let id = self.objects.insert(object, ListKind::Cached);
        tracing::debug!(?id, %url, "loaded object metadata from backing store");
        Some(id)
    }
}
