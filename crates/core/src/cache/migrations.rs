//! Cache schema setup.
//!
//! The schema version lives in SQLite's `user_version` header field. A fresh
//! file is at version 0 and gets the whole schema in one transaction; a file
//! written by a newer build is refused rather than guessed at.

use super::Error;
use tokio_rusqlite::Connection;

/// Version stamped into `user_version` once the schema is in place.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = include_str!("../../migrations/001_cache_stores.sql");

/// Bring the database up to [`SCHEMA_VERSION`].
pub async fn run(conn: &Connection) -> Result<(), Error> {
    conn.call(|conn| -> Result<(), Error> {
        let found: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(Error::from)?;

        if found == SCHEMA_VERSION {
            return Ok(());
        }
        if found > SCHEMA_VERSION {
            return Err(Error::MigrationFailed(format!(
                "cache schema version {found} is newer than supported version {SCHEMA_VERSION}"
            )));
        }

        let tx = conn.transaction().map_err(Error::from)?;
        tx.execute_batch(SCHEMA)
            .map_err(|e| Error::MigrationFailed(format!("version {SCHEMA_VERSION}: {e}")))?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(Error::from)?;
        tx.commit().map_err(Error::from)?;

        tracing::debug!(from = found, to = SCHEMA_VERSION, "cache schema ready");
        Ok(())
    })
    .await
    .map_err(Error::from)
}
