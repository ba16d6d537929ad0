//! Ledger row operations: insert, lookup, processed marks and stats.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row};

use super::connection::OnceDb;
use crate::Error;

pub(crate) const ENTRY_COLUMNS: &str = "seq, cohort, uid, payload, inserted_at, processed_at";

/// One unique work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Insertion sequence number; strictly increasing and never reused.
    pub seq: i64,
    pub cohort: String,
    pub uid: String,
    pub payload: Vec<u8>,
    pub inserted_at: DateTime<Utc>,
    pub processed: bool,
}

impl LedgerEntry {
    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let inserted_at: String = row.get(4)?;
        let processed_at: Option<String> = row.get(5)?;
        Ok(Self {
            seq: row.get(0)?,
            cohort: row.get(1)?,
            uid: row.get(2)?,
            payload: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
            inserted_at: parse_timestamp(4, &inserted_at)?,
            processed: processed_at.is_some(),
        })
    }
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Entry counts for one cohort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortStats {
    pub cohort: String,
    pub total: u64,
    pub pending: u64,
}

impl OnceDb {
    /// Record `(cohort, uid)` as a new unprocessed entry.
    ///
    /// Returns `false` without touching the stored row if the pair already
    /// exists; the first payload wins.
    pub async fn put(&self, cohort: &str, uid: &str, payload: impl AsRef<[u8]>) -> Result<bool, Error> {
        let cohort = cohort.to_string();
        let uid = uid.to_string();
        let payload = payload.as_ref().to_vec();
        let now = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let inserted = conn.execute(
                    "INSERT INTO ledger (cohort, uid, payload, inserted_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(cohort, uid) DO NOTHING",
                    params![cohort, uid, payload, now],
                )?;
                if inserted == 0 {
                    tracing::debug!(%cohort, %uid, "ledger entry already present");
                }
                Ok(inserted == 1)
            })
            .await
            .map_err(Error::from)
    }

    /// Whether `(cohort, uid)` has ever been recorded (and not yet cleaned up).
    pub async fn contains(&self, cohort: &str, uid: &str) -> Result<bool, Error> {
        let cohort = cohort.to_string();
        let uid = uid.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let found: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM ledger WHERE cohort = ?1 AND uid = ?2)",
                    params![cohort, uid],
                    |row| row.get(0),
                )?;
                Ok(found)
            })
            .await
            .map_err(Error::from)
    }

    /// Fetch a single entry.
    pub async fn get(&self, cohort: &str, uid: &str) -> Result<Option<LedgerEntry>, Error> {
        let cohort = cohort.to_string();
        let uid = uid.to_string();
        self.conn
            .call(move |conn| -> Result<Option<LedgerEntry>, Error> {
                let entry = conn
                    .query_row(
                        &format!("SELECT {ENTRY_COLUMNS} FROM ledger WHERE cohort = ?1 AND uid = ?2"),
                        params![cohort, uid],
                        LedgerEntry::from_row,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await
            .map_err(Error::from)
    }

    /// All entries of a cohort, oldest first.
    pub async fn entries(&self, cohort: &str) -> Result<Vec<LedgerEntry>, Error> {
        let cohort = cohort.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<LedgerEntry>, Error> {
                let mut stmt = conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM ledger WHERE cohort = ?1 ORDER BY seq"))?;
                let rows = stmt.query_map(params![cohort], LedgerEntry::from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Mark one entry processed. Returns `false` if it was already processed
    /// or no longer exists.
    pub async fn mark_done(&self, seq: i64) -> Result<bool, Error> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let updated = conn.execute(
                    "UPDATE ledger SET processed_at = ?2 WHERE seq = ?1 AND processed_at IS NULL",
                    params![seq, now],
                )?;
                Ok(updated == 1)
            })
            .await
            .map_err(Error::from)
    }

    /// Mark every pending entry processed, e.g. to seed a new deployment
    /// without replaying history. Returns the number of entries flipped.
    pub async fn mark_all_done(&self) -> Result<u64, Error> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let updated =
                    conn.execute("UPDATE ledger SET processed_at = ?1 WHERE processed_at IS NULL", params![now])?;
                Ok(updated as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Per-cohort totals, ordered by cohort name.
    pub async fn cohort_stats(&self) -> Result<Vec<CohortStats>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<CohortStats>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT cohort, COUNT(*), COALESCE(SUM(processed_at IS NULL), 0)
                     FROM ledger GROUP BY cohort ORDER BY cohort",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(CohortStats {
                        cohort: row.get(0)?,
                        total: row.get::<_, i64>(1)? as u64,
                        pending: row.get::<_, i64>(2)? as u64,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_contains() {
        let db = OnceDb::open_in_memory().await.unwrap();
        assert!(!db.contains("feed1", "u1").await.unwrap());

        assert!(db.put("feed1", "u1", "hello").await.unwrap());
        assert!(db.contains("feed1", "u1").await.unwrap());
        assert!(!db.contains("feed2", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_put_keeps_first_payload() {
        let db = OnceDb::open_in_memory().await.unwrap();
        assert!(db.put("feed1", "u1", "first").await.unwrap());
        assert!(!db.put("feed1", "u1", "second").await.unwrap());

        let entries = db.entries("feed1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload_str(), "first");
        assert!(!entries[0].processed);
    }

    #[tokio::test]
    async fn test_same_uid_in_other_cohort_is_distinct() {
        let db = OnceDb::open_in_memory().await.unwrap();
        assert!(db.put("feed1", "u1", "a").await.unwrap());
        assert!(db.put("feed2", "u1", "b").await.unwrap());
        assert_eq!(db.get("feed2", "u1").await.unwrap().unwrap().payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let db = OnceDb::open_in_memory().await.unwrap();
        assert!(db.get("feed1", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_done_once() {
        let db = OnceDb::open_in_memory().await.unwrap();
        db.put("feed1", "u1", "x").await.unwrap();
        let seq = db.get("feed1", "u1").await.unwrap().unwrap().seq;

        assert!(db.mark_done(seq).await.unwrap());
        assert!(!db.mark_done(seq).await.unwrap());
        assert!(db.get("feed1", "u1").await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn test_mark_all_done_and_stats() {
        let db = OnceDb::open_in_memory().await.unwrap();
        db.put("a", "1", "x").await.unwrap();
        db.put("a", "2", "x").await.unwrap();
        db.put("b", "1", "x").await.unwrap();

        let stats = db.cohort_stats().await.unwrap();
        assert_eq!(
            stats,
            vec![
                CohortStats { cohort: "a".into(), total: 2, pending: 2 },
                CohortStats { cohort: "b".into(), total: 1, pending: 1 },
            ]
        );

        assert_eq!(db.mark_all_done().await.unwrap(), 3);
        let stats = db.cohort_stats().await.unwrap();
        assert!(stats.iter().all(|s| s.pending == 0));
    }

    #[tokio::test]
    async fn test_seq_is_insertion_order() {
        let db = OnceDb::open_in_memory().await.unwrap();
        for uid in ["u1", "u2", "u3"] {
            db.put("feed1", uid, uid).await.unwrap();
        }
        let seqs: Vec<i64> = db.entries("feed1").await.unwrap().iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}
