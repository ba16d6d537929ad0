//! SQLite-backed once ledger.
//!
//! Guarantees that each `(cohort, uid)` pair is recorded once and handed to a
//! processing callback at most once per successful pass. It supports:
//!
//! - Idempotent inserts (duplicates are a silent no-op)
//! - Per-cohort bounded retention ordered by insertion sequence
//! - Resumable enumeration that halts at the first callback failure
//! - WAL mode so independent handles can share one file

pub mod cleanup;
pub mod connection;
pub mod entries;
pub mod migrations;
pub mod pending;

pub use connection::{DEFAULT_PAGE_SIZE, OnceDb};
pub use entries::{CohortStats, LedgerEntry};
pub use pending::{Abort, ForeachOutcome, Order, PendingCursor};
