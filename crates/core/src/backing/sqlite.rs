//! SQLite backing store.
//!
//! Entries are keyed by the SHA-256 of the object URL, with the payload and
//! metadata in separate slots. When a size limit is set, the oldest entries
//! are evicted after each write until the total payload fits.

use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{Connection, OptionalExtension};

use super::{BackingStore, StoreFlags, StoreParams, compute_store_key, migrations};
use crate::Error;
use url::Url;

/// Backing store on a SQLite database.
#[derive(Debug, Default)]
pub struct SqliteStore {
    conn: Option<Connection>,
    size_limit: u64,
}

impl SqliteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self) -> Result<&Connection, Error> {
        self.conn.as_ref().ok_or_else(|| Error::BackingStore("store not initialised".into()))
    }

    /// Total bytes held across both slots.
    pub fn stored_bytes(&self) -> Result<u64, Error> {
        let total: i64 =
            self.conn()?.query_row("SELECT COALESCE(SUM(LENGTH(data)), 0) FROM entries", [], |row| row.get(0))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn evict(&self, keep: &str) -> Result<(), Error> {
        if self.size_limit == 0 {
            return Ok(());
        }
        let conn = self.conn()?;
        while self.stored_bytes()? > self.size_limit {
            let oldest: Option<String> = conn
                .query_row(
                    "SELECT key FROM entries WHERE key != ?1 ORDER BY stored_at ASC, rowid ASC LIMIT 1",
                    params![keep],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(key) = oldest else { break };
            conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
            tracing::debug!(key = %key, "evicted backing store entry");
        }
        Ok(())
    }
}

impl BackingStore for SqliteStore {
    fn initialise(&mut self, params: &StoreParams) -> Result<(), Error> {
        let conn = match &params.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;",
        )?;

        migrations::run(&conn)?;

        tracing::info!(path = ?params.path, size_limit = params.size_limit, "backing store initialised");

        self.size_limit = params.size_limit;
        self.conn = Some(conn);
        Ok(())
    }

    fn finalise(&mut self) -> Result<(), Error> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| Error::Database(e))?;
        }
        Ok(())
    }

    fn store(&mut self, url: &Url, flags: StoreFlags, data: &[u8]) -> Result<(), Error> {
        let key = compute_store_key(url.as_str());
        self.conn()?.execute(
            "INSERT INTO entries (key, slot, url, data, stored_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key, slot) DO UPDATE SET url = excluded.url, data = excluded.data,
             stored_at = excluded.stored_at",
            params![key, flags.slot(), url.as_str(), data, chrono::Utc::now().timestamp_millis()],
        )?;
        self.evict(&key)
    }

    fn fetch(&mut self, url: &Url, flags: StoreFlags) -> Result<Vec<u8>, Error> {
        let key = compute_store_key(url.as_str());
        self.conn()?
            .query_row(
                "SELECT data FROM entries WHERE key = ?1 AND slot = ?2",
                params![key, flags.slot()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(url.to_string()))
    }

    fn release(&mut self, _url: &Url, _flags: StoreFlags) -> Result<(), Error> {
        Ok(())
    }

    fn invalidate(&mut self, url: &Url) -> Result<(), Error> {
        let key = compute_store_key(url.as_str());
        self.conn()?.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(size_limit: u64) -> SqliteStore {
        let mut store = SqliteStore::new();
        store.initialise(&StoreParams { path: None, size_limit }).unwrap();
        store
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_store_and_fetch() {
        let mut store = open(0);
        let u = url("https://example.com/page");
        store.store(&u, StoreFlags::None, b"hello").unwrap();
        store.store(&u, StoreFlags::Meta, b"meta").unwrap();

        assert_eq!(store.fetch(&u, StoreFlags::None).unwrap(), b"hello");
        assert_eq!(store.fetch(&u, StoreFlags::Meta).unwrap(), b"meta");
    }

    #[test]
    fn test_store_replaces_slot() {
        let mut store = open(0);
        let u = url("https://example.com/page");
        store.store(&u, StoreFlags::None, b"old").unwrap();
        store.store(&u, StoreFlags::None, b"new").unwrap();
        assert_eq!(store.fetch(&u, StoreFlags::None).unwrap(), b"new");
    }

    #[test]
    fn test_fetch_miss() {
        let mut store = open(0);
        let result = store.fetch(&url("https://example.com/missing"), StoreFlags::None);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_invalidate() {
        let mut store = open(0);
        let u = url("https://example.com/page");
        store.store(&u, StoreFlags::None, b"hello").unwrap();
        store.store(&u, StoreFlags::Meta, b"meta").unwrap();
        store.invalidate(&u).unwrap();

        assert!(store.fetch(&u, StoreFlags::None).is_err());
        assert!(store.fetch(&u, StoreFlags::Meta).is_err());
    }

    #[test]
    fn test_size_limit_evicts_oldest() {
        let mut store = open(10);
        let first = url("https://example.com/first");
        let second = url("https://example.com/second");
        store.store(&first, StoreFlags::None, b"12345678").unwrap();
        store.store(&second, StoreFlags::None, b"abcdefgh").unwrap();

        assert!(store.fetch(&first, StoreFlags::None).is_err());
        assert_eq!(store.fetch(&second, StoreFlags::None).unwrap(), b"abcdefgh");
        assert!(store.stored_bytes().unwrap() <= 10);
    }

    #[test]
    fn test_finalise_disables_store() {
        let mut store = open(0);
        store.finalise().unwrap();
        let result = store.store(&url("https://example.com/"), StoreFlags::None, b"x");
        assert!(matches!(result, Err(Error::BackingStore(_))));
    }
}
