//! Named cache stores and their entries.
//!
//! A store is a named bag of request/response pairs, the equivalent of one
//! `Cache` object in `CacheStorage`. Entries are keyed by
//! [`compute_request_key`] and tagged with the bucket of the route that
//! wrote them so expiration can run per resource type.

use super::connection::CacheDb;
use super::hash::compute_request_key;
use crate::Error;
use crate::request::{Request, Response};
use bytes::Bytes;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// A stored request/response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub method: String,
    pub url: String,
    pub bucket: String,
    pub response: Response,
    /// Unix milliseconds at insertion (or last overwrite).
    pub stored_at_ms: i64,
}

impl CacheEntry {
    /// Entry for `request` answered by `response`, stamped now.
    pub fn new(request: &Request, bucket: &str, response: Response) -> Self {
        Self {
            key: compute_request_key(&request.method, request.url.as_str()),
            method: request.method.clone(),
            url: request.url.to_string(),
            bucket: bucket.to_string(),
            response,
            stored_at_ms: now_ms(),
        }
    }

    /// Age relative to `now_ms`, never negative.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.stored_at_ms).max(0)
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct RawEntry {
    key: String,
    method: String,
    url: String,
    bucket: String,
    status: i64,
    headers_json: String,
    body: Vec<u8>,
    response_url: String,
    stored_at_ms: i64,
}

impl RawEntry {
    fn decode(self) -> Result<CacheEntry, Error> {
        let headers: Vec<(String, String)> = serde_json::from_str(&self.headers_json)
            .map_err(|e| Error::CorruptEntry(format!("{}: headers: {e}", self.url)))?;
        let status = u16::try_from(self.status)
            .map_err(|_| Error::CorruptEntry(format!("{}: status {}", self.url, self.status)))?;

        Ok(CacheEntry {
            key: self.key,
            method: self.method,
            url: self.url,
            bucket: self.bucket,
            response: Response { status, headers, body: Bytes::from(self.body), url: self.response_url },
            stored_at_ms: self.stored_at_ms,
        })
    }
}

fn insert_entry(conn: &rusqlite::Connection, store: &str, entry: &CacheEntry) -> Result<(), Error> {
    let headers_json = serde_json::to_string(&entry.response.headers)
        .map_err(|e| Error::InvalidInput(format!("failed to encode headers: {e}")))?;

    conn.execute(
        "INSERT OR IGNORE INTO stores (name, created_at_ms) VALUES (?1, ?2)",
        params![store, now_ms()],
    )?;
    conn.execute(
        "INSERT INTO entries (
            store, key, method, url, bucket, status, headers_json, body, response_url, stored_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(store, key) DO UPDATE SET
            method = excluded.method,
            url = excluded.url,
            bucket = excluded.bucket,
            status = excluded.status,
            headers_json = excluded.headers_json,
            body = excluded.body,
            response_url = excluded.response_url,
            stored_at_ms = excluded.stored_at_ms",
        params![
            store,
            &entry.key,
            &entry.method,
            &entry.url,
            &entry.bucket,
            entry.response.status as i64,
            headers_json,
            entry.response.body.as_ref(),
            &entry.response.url,
            entry.stored_at_ms,
        ],
    )?;
    Ok(())
}

impl CacheDb {
    /// Open (or create) a named store.
    pub async fn open_store(&self, name: &str) -> Result<(), Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT OR IGNORE INTO stores (name, created_at_ms) VALUES (?1, ?2)",
                    params![name, now_ms()],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Check whether a store exists.
    pub async fn has_store(&self, name: &str) -> Result<bool, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM stores WHERE name = ?1)",
                    params![name],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await
            .map_err(Error::from)
    }

    /// List all store names, oldest first.
    pub async fn store_names(&self) -> Result<Vec<String>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare("SELECT name FROM stores ORDER BY created_at_ms ASC, name ASC")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete a store and every entry in it.
    ///
    /// Returns false if the store did not exist.
    pub async fn delete_store(&self, name: &str) -> Result<bool, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted = conn.execute("DELETE FROM stores WHERE name = ?1", params![name])?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or overwrite one entry, creating the store if needed.
    pub async fn put_entry(&self, store: &str, entry: &CacheEntry) -> Result<(), Error> {
        let store = store.to_string();
        let entry = entry.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> { insert_entry(conn, &store, &entry) })
            .await
            .map_err(Error::from)
    }

    /// Insert a batch of entries in one transaction.
    ///
    /// Either every entry lands or none does.
    pub async fn put_entries(&self, store: &str, entries: Vec<CacheEntry>) -> Result<(), Error> {
        let store = store.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                for entry in &entries {
                    insert_entry(&tx, &store, entry)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Look up an entry by request key.
    ///
    /// Returns None if the store or the key doesn't exist.
    pub async fn match_entry(&self, store: &str, key: &str) -> Result<Option<CacheEntry>, Error> {
        let store = store.to_string();
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT key, method, url, bucket, status, headers_json, body, response_url, stored_at_ms
                    FROM entries WHERE store = ?1 AND key = ?2",
                )?;

                let result = stmt.query_row(params![store, key], |row| {
                    Ok(RawEntry {
                        key: row.get(0)?,
                        method: row.get(1)?,
                        url: row.get(2)?,
                        bucket: row.get(3)?,
                        status: row.get(4)?,
                        headers_json: row.get(5)?,
                        body: row.get(6)?,
                        response_url: row.get(7)?,
                        stored_at_ms: row.get(8)?,
                    })
                });

                match result {
                    Ok(raw) => raw.decode().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Look up a request in several stores, first hit wins.
    pub async fn match_request(&self, stores: &[&str], request: &Request) -> Result<Option<CacheEntry>, Error> {
        let key = compute_request_key(&request.method, request.url.as_str());
        for store in stores {
            if let Some(entry) = self.match_entry(store, &key).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Delete one entry. Returns false if it was not present.
    pub async fn delete_entry(&self, store: &str, key: &str) -> Result<bool, Error> {
        let store = store.to_string();
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted = conn.execute("DELETE FROM entries WHERE store = ?1 AND key = ?2", params![store, key])?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// URLs of every entry in a store, oldest first.
    pub async fn entry_urls(&self, store: &str) -> Result<Vec<String>, Error> {
        let store = store.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<String>, Error> {
                let mut stmt =
                    conn.prepare("SELECT url FROM entries WHERE store = ?1 ORDER BY stored_at_ms ASC, id ASC")?;
                let urls = stmt
                    .query_map(params![store], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(urls)
            })
            .await
            .map_err(Error::from)
    }

    /// Number of entries a route has written into a store.
    pub async fn count_bucket(&self, store: &str, bucket: &str) -> Result<u64, Error> {
        let store = store.to_string();
        let bucket = bucket.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE store = ?1 AND bucket = ?2",
                    params![store, bucket],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Evict oldest entries of a bucket until at most `max_entries` remain.
    ///
    /// Returns the number of deleted entries.
    pub async fn evict_oldest(&self, store: &str, bucket: &str, max_entries: usize) -> Result<u64, Error> {
        let store = store.to_string();
        let bucket = bucket.to_string();
        let max = max_entries as i64;
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE store = ?1 AND bucket = ?2",
                    params![store, bucket],
                    |row| row.get(0),
                )?;
                if count <= max {
                    return Ok(0);
                }

                let to_delete = count - max;
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE id IN (
                    SELECT id FROM entries WHERE store = ?1 AND bucket = ?2
                    ORDER BY stored_at_ms ASC, id ASC LIMIT ?3
                )",
                    params![store, bucket, to_delete],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Evict entries of a bucket stored before `cutoff_ms`.
    ///
    /// Returns the number of deleted entries.
    pub async fn evict_older_than(&self, store: &str, bucket: &str, cutoff_ms: i64) -> Result<u64, Error> {
        let store = store.to_string();
        let bucket = bucket.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let deleted = conn.execute(
                    "DELETE FROM entries WHERE store = ?1 AND bucket = ?2 AND stored_at_ms < ?3",
                    params![store, bucket, cutoff_ms],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::canonicalize;

    fn make_entry(url: &str, bucket: &str, stored_at_ms: i64) -> CacheEntry {
        let request = Request::get(canonicalize(url).unwrap());
        let response = Response::new(200, format!("body of {url}"), url).with_header("Content-Type", "text/plain");
        CacheEntry { stored_at_ms, ..CacheEntry::new(&request, bucket, response) }
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let entry = make_entry("https://taxi.example.com/", "pages", 1_000);

        db.put_entry("runtime", &entry).await.unwrap();

        let found = db.match_entry("runtime", &entry.key).await.unwrap().unwrap();
        assert_eq!(found, entry);
        assert_eq!(found.response.header("content-type"), Some("text/plain"));
        assert!(db.has_store("runtime").await.unwrap());
    }

    #[tokio::test]
    async fn test_match_missing() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert!(db.match_entry("runtime", "nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_match_request_searches_in_order() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let url = "https://taxi.example.com/";
        let mut precached = make_entry(url, "precache", 1);
        precached.response.body = Bytes::from_static(b"precached");
        let mut runtime = make_entry(url, "pages", 2);
        runtime.response.body = Bytes::from_static(b"runtime");
        db.put_entry("precache", &precached).await.unwrap();
        db.put_entry("runtime", &runtime).await.unwrap();

        let request = Request::get(canonicalize(url).unwrap());
        let hit = db.match_request(&["precache", "runtime"], &request).await.unwrap().unwrap();
        assert_eq!(hit.response.body, Bytes::from_static(b"precached"));

        let hit = db.match_request(&["runtime", "precache"], &request).await.unwrap().unwrap();
        assert_eq!(hit.response.body, Bytes::from_static(b"runtime"));
    }

    #[tokio::test]
    async fn test_delete_store_cascades() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let entry = make_entry("https://taxi.example.com/static/style.css", "static-resources", 1);
        db.put_entry("old-v1", &entry).await.unwrap();

        assert!(db.delete_store("old-v1").await.unwrap());
        assert!(!db.delete_store("old-v1").await.unwrap());
        assert!(db.store_names().await.unwrap().is_empty());
        assert!(db.match_entry("old-v1", &entry.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_entries_is_atomic() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let good = make_entry("https://taxi.example.com/", "precache", 1);
        let bad = make_entry("https://taxi.example.com/static/style.css", "precache", 1);

        db.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_style AFTER INSERT ON entries
                     WHEN NEW.url LIKE '%style.css'
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )
            })
            .await
            .unwrap();

        let result = db.put_entries("precache", vec![good, bad]).await;
        assert!(result.is_err());
        assert!(db.entry_urls("precache").await.unwrap().is_empty());
        assert!(!db.has_store("precache").await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_oldest() {
        let db = CacheDb::open_in_memory().await.unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let entry = make_entry(&format!("https://taxi.example.com/{name}.png"), "images", i as i64);
            db.put_entry("runtime", &entry).await.unwrap();
        }
        db.put_entry("runtime", &make_entry("https://taxi.example.com/", "pages", 0))
            .await
            .unwrap();

        let deleted = db.evict_oldest("runtime", "images", 2).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.count_bucket("runtime", "images").await.unwrap(), 2);
        assert_eq!(db.count_bucket("runtime", "pages").await.unwrap(), 1);

        let urls = db.entry_urls("runtime").await.unwrap();
        assert!(!urls.contains(&"https://taxi.example.com/a.png".to_string()));
    }

    #[tokio::test]
    async fn test_evict_older_than() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_entry("runtime", &make_entry("https://taxi.example.com/old.png", "images", 100))
            .await
            .unwrap();
        db.put_entry("runtime", &make_entry("https://taxi.example.com/new.png", "images", 900))
            .await
            .unwrap();

        let deleted = db.evict_older_than("runtime", "images", 500).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.entry_urls("runtime").await.unwrap(), vec!["https://taxi.example.com/new.png"]);
    }

    #[tokio::test]
    async fn test_store_names_and_delete_entry() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.open_store("a").await.unwrap();
        db.open_store("b").await.unwrap();
        db.open_store("a").await.unwrap();
        let mut names = db.store_names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        let entry = make_entry("https://taxi.example.com/", "pages", 1);
        db.put_entry("a", &entry).await.unwrap();
        assert!(db.delete_entry("a", &entry.key).await.unwrap());
        assert!(!db.delete_entry("a", &entry.key).await.unwrap());
    }
}
