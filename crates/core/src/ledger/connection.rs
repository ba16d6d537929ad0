//! Ledger handle management with pragma configuration.
//!
//! This module handles opening the SQLite database, applying required pragmas
//! for concurrency (WAL mode, busy timeout), and running migrations.

use std::path::Path;

use tokio_rusqlite::Connection;

use super::migrations;
use crate::Error;

/// Rows fetched per page when enumerating pending entries.
pub const DEFAULT_PAGE_SIZE: usize = 64;

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA busy_timeout=5000;
     PRAGMA temp_store=MEMORY;";

/// Handle to the once ledger.
///
/// A handle belongs to one worker. It is deliberately not `Clone`: a job
/// thread and a message-handling thread each open their own handle against
/// the same file and rely on SQLite transactions for isolation. Call
/// [`OnceDb::close`] to release the handle deterministically; dropping it
/// also closes the connection.
#[derive(Debug)]
pub struct OnceDb {
    pub(crate) conn: Connection,
    pub(crate) page_size: usize,
}

impl OnceDb {
    /// Open a ledger at the specified path.
    ///
    /// Creates the file if it doesn't exist, applies pragmas, and runs any
    /// pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    /// Open an in-memory ledger for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| conn.execute_batch(PRAGMAS))
            .await
            .map_err(Error::Database)?;

        migrations::run(&conn).await?;

        Ok(Self { conn, page_size: DEFAULT_PAGE_SIZE })
    }

    /// Set how many pending rows are loaded per round trip while enumerating.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Close the underlying connection, surfacing any error from SQLite.
    pub async fn close(self) -> Result<(), Error> {
        self.conn.close().await.map_err(Error::from)
    }
}
