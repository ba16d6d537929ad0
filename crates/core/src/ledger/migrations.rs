//! Versioned schema for the ledger file, tracked in `_migrations`.

use tokio_rusqlite::rusqlite::TransactionBehavior;
use tokio_rusqlite::{Connection, params};

use crate::Error;

/// `(version, description, sql)`, ascending.
const MIGRATIONS: &[(i64, &str, &str)] = &[(1, "once ledger", include_str!("../../migrations/001_ledger.sql"))];

/// Bring the schema up to the latest version.
///
/// Holds the write lock for the whole pass, so two handles opening the same
/// file apply each version once.
pub async fn run(conn: &Connection) -> Result<(), Error> {
    conn.call(|conn| -> Result<(), Error> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current: i64 = tx.query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| row.get(0))?;

        for (version, description, sql) in MIGRATIONS {
            if *version > current {
                tx.execute_batch(sql)
                    .map_err(|e| Error::MigrationFailed(format!("{version} ({description}): {e}")))?;
                tx.execute(
                    "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                    params![version, description, chrono::Utc::now().to_rfc3339()],
                )?;
                tracing::debug!(version, description, "applied ledger migration");
            }
        }

        tx.commit()?;
        Ok(())
    })
    .await
    .map_err(Error::from)
}
