//! Bounded retention for the ledger.
//!
//! Retention is per cohort and ordered by the insertion sequence number:
//! the `limit` highest `seq` values of a cohort survive, everything older is
//! deleted whether processed or not. Each cohort is trimmed in its own
//! immediate transaction, so an interrupted cleanup leaves every cohort either
//! fully trimmed or untouched, and a concurrent `put` from another handle
//! waits instead of slipping in between the count and the delete.

use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{Connection, TransactionBehavior};

use super::connection::OnceDb;
use crate::Error;

fn trim_cohort(conn: &mut Connection, cohort: &str, limit: i64) -> Result<u64, Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let deleted = tx.execute(
        "DELETE FROM ledger
         WHERE cohort = ?1
           AND seq NOT IN (SELECT seq FROM ledger WHERE cohort = ?1 ORDER BY seq DESC LIMIT ?2)",
        params![cohort, limit],
    )?;
    tx.commit()?;
    Ok(deleted as u64)
}

impl OnceDb {
    /// Keep the newest `limit` entries of every cohort and delete the rest.
    ///
    /// Returns the total number of deleted entries.
    pub async fn cleanup(&self, limit: usize) -> Result<u64, Error> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deleted = self
            .conn
            .call(move |conn| -> Result<u64, Error> {
                let cohorts: Vec<String> = {
                    let mut stmt = conn.prepare("SELECT DISTINCT cohort FROM ledger ORDER BY cohort")?;
                    let rows = stmt.query_map([], |row| row.get(0))?;
                    rows.collect::<Result<_, _>>()?
                };

                let mut total = 0u64;
                for cohort in &cohorts {
                    total += trim_cohort(conn, cohort, limit)?;
                }
                Ok(total)
            })
            .await
            .map_err(Error::from)?;

        tracing::info!(limit, deleted, "ledger cleanup finished");
        Ok(deleted)
    }

    /// Trim a single cohort to its newest `limit` entries.
    pub async fn cleanup_cohort(&self, cohort: &str, limit: usize) -> Result<u64, Error> {
        let cohort = cohort.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.conn
            .call(move |conn| trim_cohort(conn, &cohort, limit))
            .await
            .map_err(Error::from)
    }
}
