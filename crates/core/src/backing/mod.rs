//! Backing store contract and implementations.
//!
//! A backing store is an external key/value store for object payloads and
//! their serialised metadata, keyed by URL. Each URL has two slots selected
//! by [`StoreFlags`]. Calls are synchronous; the cache makes no attempt to
//! hide their latency.

mod hash;
mod migrations;
mod sqlite;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use url::Url;

use crate::Error;

pub use hash::compute_store_key;
pub use sqlite::SqliteStore;

/// Selects the payload or metadata slot of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFlags {
    /// Object source bytes.
    None,
    /// Serialised object metadata.
    Meta,
}

impl StoreFlags {
    pub(crate) fn slot(self) -> i64 {
        match self {
            StoreFlags::None => 0,
            StoreFlags::Meta => 1,
        }
    }
}

/// Parameters handed to [`BackingStore::initialise`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreParams {
    /// Location of the store; `None` selects a transient store.
    pub path: Option<PathBuf>,
    /// Upper bound on stored bytes; 0 disables the bound.
    pub size_limit: u64,
}

/// External persistent store for cache objects.
pub trait BackingStore {
    /// Prepare the store for use.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened; the cache then runs
    /// without persistence.
    fn initialise(&mut self, params: &StoreParams) -> Result<(), Error>;

    /// Flush and close the store. Later calls fail until re-initialised.
    fn finalise(&mut self) -> Result<(), Error>;

    /// Write one slot for `url`, replacing any previous contents.
    fn store(&mut self, url: &Url, flags: StoreFlags, data: &[u8]) -> Result<(), Error>;

    /// Read one slot for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the slot is empty.
    fn fetch(&mut self, url: &Url, flags: StoreFlags) -> Result<Vec<u8>, Error>;

    /// Signal that the caller no longer needs data returned by `fetch`.
    fn release(&mut self, url: &Url, flags: StoreFlags) -> Result<(), Error>;

    /// Remove both slots for `url`.
    fn invalidate(&mut self, url: &Url) -> Result<(), Error>;
}

/// A store that holds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl BackingStore for NullStore {
    fn initialise(&mut self, _params: &StoreParams) -> Result<(), Error> {
        Ok(())
    }

    fn finalise(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn store(&mut self, _url: &Url, _flags: StoreFlags, _data: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn fetch(&mut self, url: &Url, _flags: StoreFlags) -> Result<Vec<u8>, Error> {
        Err(Error::NotFound(url.to_string()))
    }

    fn release(&mut self, _url: &Url, _flags: StoreFlags) -> Result<(), Error> {
        Ok(())
    }

    fn invalidate(&mut self, _url: &Url) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<(String, StoreFlags), Vec<u8>>,
    enabled: bool,
    writes: usize,
}

/// In-process store.
///
/// Clones share the same entries, so a store can outlive the cache that
/// wrote to it and be handed to a fresh cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Rc<RefCell<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a slot is populated.
    pub fn contains(&self, url: &Url, flags: StoreFlags) -> bool {
        self.inner.borrow().entries.contains_key(&(url.to_string(), flags))
    }

    /// Number of successful `store` calls since creation.
    pub fn writes(&self) -> usize {
        self.inner.borrow().writes
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.borrow().enabled
    }

    /// Overwrite a slot directly, bypassing the enabled check.
    pub fn insert_raw(&self, url: &Url, flags: StoreFlags, data: Vec<u8>) {
        self.inner.borrow_mut().entries.insert((url.to_string(), flags), data);
    }

    fn check_enabled(&self) -> Result<(), Error> {
        if self.inner.borrow().enabled { Ok(()) } else { Err(Error::BackingStore("store not initialised".into())) }
    }
}

impl BackingStore for MemoryStore {
    fn initialise(&mut self, _params: &StoreParams) -> Result<(), Error> {
        self.inner.borrow_mut().enabled = true;
        Ok(())
    }

    fn finalise(&mut self) -> Result<(), Error> {
        self.inner.borrow_mut().enabled = false;
        Ok(())
    }

    fn store(&mut self, url: &Url, flags: StoreFlags, data: &[u8]) -> Result<(), Error> {
        self.check_enabled()?;
        let mut inner = self.inner.borrow_mut();
        inner.entries.insert((url.to_string(), flags), data.to_vec());
        inner.writes += 1;
        Ok(())
    }

    fn fetch(&mut self, url: &Url, flags: StoreFlags) -> Result<Vec<u8>, Error> {
        self.check_enabled()?;
        self.inner
            .borrow()
            .entries
            .get(&(url.to_string(), flags))
            .cloned()
            .ok_or_else(|| Error::NotFound(url.to_string()))
    }

    fn release(&mut self, _url: &Url, _flags: StoreFlags) -> Result<(), Error> {
        Ok(())
    }

    fn invalidate(&mut self, url: &Url) -> Result<(), Error> {
        let key = url.to_string();
        self.inner.borrow_mut().entries.retain(|(k, _), _| *k != key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_null_store_always_misses() {
        let mut store = NullStore;
        store.initialise(&StoreParams::default()).unwrap();
        store.store(&url("http://a.test/"), StoreFlags::None, b"x").unwrap();
        let result = store.fetch(&url("http://a.test/"), StoreFlags::None);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_memory_store_slots_are_independent() {
        let mut store = MemoryStore::new();
        store.initialise(&StoreParams::default()).unwrap();
        let u = url("http://a.test/");
        store.store(&u, StoreFlags::None, b"payload").unwrap();
        store.store(&u, StoreFlags::Meta, b"meta").unwrap();

        assert_eq!(store.fetch(&u, StoreFlags::None).unwrap(), b"payload");
        assert_eq!(store.fetch(&u, StoreFlags::Meta).unwrap(), b"meta");
        assert_eq!(store.writes(), 2);
    }

    #[test]
    fn test_memory_store_invalidate_removes_both() {
        let mut store = MemoryStore::new();
        store.initialise(&StoreParams::default()).unwrap();
        let u = url("http://a.test/");
        store.store(&u, StoreFlags::None, b"payload").unwrap();
        store.store(&u, StoreFlags::Meta, b"meta").unwrap();
        store.invalidate(&u).unwrap();

        assert!(!store.contains(&u, StoreFlags::None));
        assert!(!store.contains(&u, StoreFlags::Meta));
    }

    #[test]
    fn test_memory_store_disabled_after_finalise() {
        let mut store = MemoryStore::new();
        store.initialise(&StoreParams::default()).unwrap();
        store.finalise().unwrap();
        let result = store.store(&url("http://a.test/"), StoreFlags::None, b"x");
        assert!(matches!(result, Err(Error::BackingStore(_))));
    }

    #[test]
    fn test_memory_store_clones_share_entries() {
        let mut store = MemoryStore::new();
        store.initialise(&StoreParams::default()).unwrap();
        let other = store.clone();
        store.store(&url("http://a.test/"), StoreFlags::None, b"x").unwrap();
        assert!(other.contains(&url("http://a.test/"), StoreFlags::None));
    }
}
