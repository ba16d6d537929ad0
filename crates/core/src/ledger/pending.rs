//! Resumable enumeration of unprocessed entries.
//!
//! [`PendingCursor`] is a lazy, paged view over unprocessed rows keyed on the
//! last `seq` it returned, so it never revisits or skips a row within a pass.
//! [`OnceDb::foreach`] drives a cursor, marks each entry processed after its
//! callback succeeds, and stops at the first failure. Whatever follows the
//! failed entry stays pending for the next pass.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;

use tokio_rusqlite::params;

use super::connection::OnceDb;
use super::entries::{ENTRY_COLUMNS, LedgerEntry};
use crate::Error;

/// Enumeration direction over the insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    OldestFirst,
    NewestFirst,
}

/// Lazy sequence of unprocessed entries.
pub struct PendingCursor<'a> {
    db: &'a OnceDb,
    order: Order,
    last_seq: Option<i64>,
    buffer: VecDeque<LedgerEntry>,
    exhausted: bool,
}

impl<'a> PendingCursor<'a> {
    fn new(db: &'a OnceDb, order: Order) -> Self {
        Self { db, order, last_seq: None, buffer: VecDeque::new(), exhausted: false }
    }

    /// Next unprocessed entry, loading another page when the buffer runs dry.
    pub async fn next(&mut self) -> Result<Option<LedgerEntry>, Error> {
        if self.buffer.is_empty() && !self.exhausted {
            self.load_page().await?;
        }
        let entry = self.buffer.pop_front();
        if let Some(e) = &entry {
            self.last_seq = Some(e.seq);
        }
        Ok(entry)
    }

    async fn load_page(&mut self) -> Result<(), Error> {
        let page_size = self.db.page_size as i64;
        let (bound, sql) = match self.order {
            Order::OldestFirst => (
                self.last_seq.unwrap_or(i64::MIN),
                format!(
                    "SELECT {ENTRY_COLUMNS} FROM ledger
                     WHERE processed_at IS NULL AND seq > ?1 ORDER BY seq ASC LIMIT ?2"
                ),
            ),
            Order::NewestFirst => (
                self.last_seq.unwrap_or(i64::MAX),
                format!(
                    "SELECT {ENTRY_COLUMNS} FROM ledger
                     WHERE processed_at IS NULL AND seq < ?1 ORDER BY seq DESC LIMIT ?2"
                ),
            ),
        };

        let page = self
            .db
            .conn
            .call(move |conn| -> Result<Vec<LedgerEntry>, Error> {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![bound, page_size], LedgerEntry::from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(Error::from)?;

        self.exhausted = (page.len() as i64) < page_size;
        self.buffer.extend(page);
        Ok(())
    }
}

/// Where and why an enumeration pass stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub seq: i64,
    pub cohort: String,
    pub uid: String,
    pub reason: String,
}

/// Result of one enumeration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeachOutcome {
    /// Entries whose callback succeeded and are now marked processed.
    pub processed: usize,
    /// Set when a callback failed; that entry and all later ones are still pending.
    pub aborted: Option<Abort>,
}

impl ForeachOutcome {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    /// Turn an aborted pass into [`Error::CallbackAborted`].
    pub fn into_result(self) -> Result<usize, Error> {
        match self.aborted {
            None => Ok(self.processed),
            Some(Abort { cohort, uid, reason, .. }) => Err(Error::CallbackAborted { cohort, uid, reason }),
        }
    }
}

impl OnceDb {
    /// Unprocessed entries, oldest first.
    pub fn pending(&self) -> PendingCursor<'_> {
        PendingCursor::new(self, Order::OldestFirst)
    }

    /// Unprocessed entries in the given order.
    pub fn pending_in(&self, order: Order) -> PendingCursor<'_> {
        PendingCursor::new(self, order)
    }

    /// Hand every unprocessed entry to `callback`, oldest first.
    ///
    /// An entry is marked processed only after its callback returns `Ok`.
    /// The first `Err` stops the pass; see [`ForeachOutcome`].
    pub async fn foreach<F, Fut, E>(&self, callback: F) -> Result<ForeachOutcome, Error>
    where
        F: FnMut(LedgerEntry) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.drive(self.pending(), callback).await
    }

    /// Like [`OnceDb::foreach`] but newest first.
    pub async fn foreach_rev<F, Fut, E>(&self, callback: F) -> Result<ForeachOutcome, Error>
    where
        F: FnMut(LedgerEntry) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        self.drive(self.pending_in(Order::NewestFirst), callback).await
    }

    async fn drive<F, Fut, E>(&self, mut cursor: PendingCursor<'_>, mut callback: F) -> Result<ForeachOutcome, Error>
    where
        F: FnMut(LedgerEntry) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut outcome = ForeachOutcome::default();

        while let Some(entry) = cursor.next().await? {
            let seq = entry.seq;
            let cohort = entry.cohort.clone();
            let uid = entry.uid.clone();

            match callback(entry).await {
                Ok(()) => {
                    self.mark_done(seq).await?;
                    outcome.processed += 1;
                }
                Err(e) => {
                    let reason = e.to_string();
                    tracing::warn!(%cohort, %uid, %reason, processed = outcome.processed, "ledger pass aborted");
                    outcome.aborted = Some(Abort { seq, cohort, uid, reason });
                    return Ok(outcome);
                }
            }
        }

        tracing::debug!(processed = outcome.processed, "ledger pass complete");
        Ok(outcome)
    }
}
