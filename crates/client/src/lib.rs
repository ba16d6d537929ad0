//! Network side of scrapekit.
//!
//! This crate provides the conditional-GET transport, the caching fetcher
//! built on the core content store, and batch acquisition of local files.

pub mod acquire;
pub mod fetch;
pub mod fetcher;

pub use acquire::{BatchAcquirer, OnceOptions, OnceReport, TargetFailure, write_once};
pub use fetch::{FetchClient, FetchConfig, Transport, TransportResponse, Validators};
pub use fetcher::{FetchOutcome, Fetcher};
