//! Core types and shared functionality for scrapekit.
//!
//! This crate provides:
//! - On-disk content store keyed by request fingerprint
//! - SQLite once ledger for at-most-once processing
//! - Unified error types
//! - Configuration structures

pub mod config;
pub mod error;
pub mod ledger;
pub mod store;

pub use config::{AppConfig, ConfigError};
pub use error::Error;
pub use ledger::{ForeachOutcome, LedgerEntry, OnceDb};
pub use store::{CacheEntry, ContentStore, Fingerprint};
