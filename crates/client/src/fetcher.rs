//! Conditional fetcher on top of the content store.
//!
//! Resolution order for a target:
//!
//! 1. `cache_only`: whatever the store holds, no network
//! 2. entry younger than the freshness window: served as is, no network
//! 3. entry present: conditional GET; 304 refreshes `fetched_at`, 2xx replaces it
//! 4. no entry: plain GET; 2xx is stored
//!
//! Network failures become [`FetchOutcome::Failed`] and are logged here.
//! Storage failures are returned as `Err`.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use scrapekit_core::store::canonicalize;
use scrapekit_core::{AppConfig, CacheEntry, ContentStore, Error, Fingerprint};

use crate::acquire::{self, BatchAcquirer, OnceReport};
use crate::fetch::{FetchClient, FetchConfig, Transport, TransportResponse, Validators};

/// Default freshness window.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(45);

/// How a fetch was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Served from the store inside the freshness window.
    Fresh(CacheEntry),
    /// New content from the network, now stored.
    Fetched(CacheEntry),
    /// The server confirmed the stored payload; `fetched_at` was advanced.
    NotModified(CacheEntry),
    /// `cache_only` lookup that found an entry.
    CacheOnly(CacheEntry),
    /// `cache_only` lookup that found nothing.
    Missing,
    /// The network step failed. `stale` is the previously stored entry, if any.
    Failed { reason: String, stale: Option<CacheEntry> },
}

impl FetchOutcome {
    /// The entry to use, including a stale one after a failed refresh.
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            FetchOutcome::Fresh(e)
            | FetchOutcome::Fetched(e)
            | FetchOutcome::NotModified(e)
            | FetchOutcome::CacheOnly(e) => Some(e),
            FetchOutcome::Failed { stale, .. } => stale.as_ref(),
            FetchOutcome::Missing => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry> {
        match self {
            FetchOutcome::Fresh(e)
            | FetchOutcome::Fetched(e)
            | FetchOutcome::NotModified(e)
            | FetchOutcome::CacheOnly(e) => Some(e),
            FetchOutcome::Failed { stale, .. } => stale,
            FetchOutcome::Missing => None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.entry().map(|e| &e.payload)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed { .. })
    }
}

/// Explicit handle combining a content store, a transport and a freshness window.
pub struct Fetcher<T: Transport = FetchClient> {
    store: ContentStore,
    transport: T,
    freshness: Duration,
}

impl Fetcher<FetchClient> {
    /// Build a fetcher with the reqwest transport from application config.
    pub async fn from_config(config: &AppConfig) -> Result<Self, Error> {
        let store = ContentStore::open(&config.cache_dir).await?;
        let transport = FetchClient::new(FetchConfig::from(config))?;
        Ok(Self::new(store, transport).with_freshness(config.freshness()))
    }
}

impl<T: Transport> Fetcher<T> {
    pub fn new(store: ContentStore, transport: T) -> Self {
        Self { store, transport, freshness: DEFAULT_FRESHNESS }
    }

    pub fn with_freshness(mut self, window: Duration) -> Self {
        self.freshness = window;
        self
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Current content for `target`, touching the network as little as possible.
    ///
    /// # Errors
    ///
    /// `Error::InvalidUrl` for targets that are not http(s) URLs, and storage
    /// errors from the cache directory. Network problems are never returned
    /// as `Err`.
    pub async fn get(&self, target: &str, cache_only: bool) -> Result<FetchOutcome, Error> {
        let (url, fp) = Fingerprint::parse(target)?;
        let prior = self.store.get(&fp).await?;

        if cache_only {
            return Ok(prior.map_or(FetchOutcome::Missing, FetchOutcome::CacheOnly));
        }

        if let Some(entry) = &prior
            && entry.age(Utc::now()) < self.freshness
        {
            tracing::debug!(url = %url, "cache hit within freshness window");
            return Ok(FetchOutcome::Fresh(entry.clone()));
        }

        let validators = prior.as_ref().map(Validators::from_entry).unwrap_or_default();

        let response = match self.transport.get(&url, &validators).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, stale = prior.is_some(), "fetch failed");
                return Ok(FetchOutcome::Failed { reason: e.to_string(), stale: prior });
            }
        };

        match (response, prior) {
            (TransportResponse::NotModified, Some(mut entry)) => {
                let now = Utc::now();
                self.store.touch(&fp, now).await?;
                entry.fetched_at = now;
                tracing::debug!(url = %url, "not modified, cache revalidated");
                Ok(FetchOutcome::NotModified(entry))
            }
            (TransportResponse::NotModified, None) => {
                tracing::warn!(url = %url, "304 without a cached entry");
                Ok(FetchOutcome::Failed { reason: "not modified but nothing cached".into(), stale: None })
            }
            (TransportResponse::Modified { body, etag, last_modified, content_type, .. }, _) => {
                let entry = CacheEntry {
                    fingerprint: fp,
                    url: url.to_string(),
                    payload: body,
                    etag,
                    last_modified,
                    content_type,
                    fetched_at: Utc::now(),
                };
                self.store.put(&entry).await?;
                Ok(FetchOutcome::Fetched(entry))
            }
        }
    }

    /// Download `target` straight to `dest`, bypassing the content store.
    ///
    /// Downloaded files are large and already persisted at `dest`, so they are
    /// not duplicated into the cache directory. The file is written as
    /// `dest.inprogress` and renamed, so `dest` either does not exist or is
    /// complete. Returns `false` when the download failed.
    pub async fn file(&self, target: &str, dest: &Path, mtime: Option<DateTime<Utc>>) -> Result<bool, Error> {
        let url = canonicalize(target)?;

        let body = match self.transport.get(&url, &Validators::default()).await {
            Ok(TransportResponse::Modified { body, .. }) => body,
            Ok(TransportResponse::NotModified) => {
                tracing::warn!(url = %url, "304 for an unconditional download");
                return Ok(false);
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "download failed");
                return Ok(false);
            }
        };

        acquire::write_file(dest, &body, mtime).await?;
        Ok(true)
    }

    /// Fetch `target` and parse it as JSON, returning `fallback` when there is
    /// no payload or it does not parse.
    pub async fn json<D: DeserializeOwned>(&self, target: &str, fallback: D) -> Result<D, Error> {
        let outcome = self.get(target, false).await?;
        let Some(payload) = outcome.payload() else {
            return Ok(fallback);
        };
        match serde_json::from_slice(payload) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(url = target, error = %e, "payload is not valid JSON, using fallback");
                Ok(fallback)
            }
        }
    }

    /// Ensure `{base_name}.{ext}` exists in `dest_dir` for every target.
    ///
    /// Shorthand for [`BatchAcquirer::once`] with default options.
    pub async fn once(
        &self, dest_dir: &Path, base_name: &str, targets: &[&str], timestamp: Option<DateTime<Utc>>,
        description: Option<&str>,
    ) -> Result<OnceReport, Error> {
        BatchAcquirer::new(self)
            .once(dest_dir, base_name, targets, timestamp, description)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::ScriptedTransport;
    use std::collections::HashMap;

    const FEED: &str = "https://example.com/feed.xml";

    async fn fetcher(dir: &Path) -> Fetcher<ScriptedTransport> {
        let store = ContentStore::open(dir).await.unwrap();
        Fetcher::new(store, ScriptedTransport::new())
    }

    async fn age_entry(f: &Fetcher<ScriptedTransport>, target: &str, secs: i64) -> CacheEntry {
        let (_, fp) = Fingerprint::parse(target).unwrap();
        let mut entry = f.store().get(&fp).await.unwrap().unwrap();
        entry.fetched_at = Utc::now() - chrono::Duration::seconds(secs);
        f.store().put(&entry).await.unwrap();
        entry
    }

    #[tokio::test]
    async fn test_first_fetch_stores_entry() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok(FEED, "<rss>1</rss>", Some("\"v1\""));

        let outcome = f.get(FEED, false).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));
        assert_eq!(&outcome.payload().unwrap()[..], b"<rss>1</rss>");

        let calls = f.transport().calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_second_fetch_within_window_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok(FEED, "<rss>1</rss>", None);

        f.get(FEED, false).await.unwrap();
        let outcome = f.get(FEED, false).await.unwrap();

        assert!(matches!(outcome, FetchOutcome::Fresh(_)));
        assert_eq!(f.transport().call_count(), 1);
    }

    #[tokio::test]
    async fn test_not_modified_keeps_payload_and_advances_fetched_at() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok(FEED, "<rss>1</rss>", Some("\"v1\""));
        f.get(FEED, false).await.unwrap();
        let aged = age_entry(&f, FEED, 120).await;

        f.transport().not_modified(FEED);
        let outcome = f.get(FEED, false).await.unwrap();

        let FetchOutcome::NotModified(entry) = outcome else { panic!("expected NotModified") };
        assert_eq!(entry.payload, aged.payload);
        assert!(entry.fetched_at > aged.fetched_at);

        let calls = f.transport().calls();
        assert_eq!(calls[1].1.etag.as_deref(), Some("\"v1\""));

        let stored = f.store().get(&entry.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.payload, aged.payload);
        assert!(stored.fetched_at > aged.fetched_at);
    }

    #[tokio::test]
    async fn test_changed_content_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok(FEED, "old", Some("\"v1\""));
        f.get(FEED, false).await.unwrap();
        age_entry(&f, FEED, 120).await;

        f.transport().ok(FEED, "new", Some("\"v2\""));
        let outcome = f.get(FEED, false).await.unwrap();

        let FetchOutcome::Fetched(entry) = outcome else { panic!("expected Fetched") };
        assert_eq!(&entry.payload[..], b"new");
        assert_eq!(entry.etag.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn test_failure_without_cache_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().fail(FEED, "dns error");

        let outcome = f.get(FEED, false).await.unwrap();
        assert!(outcome.is_failed());
        assert!(outcome.payload().is_none());
    }

    #[tokio::test]
    async fn test_failure_with_cache_returns_stale() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok(FEED, "cached", None);
        f.get(FEED, false).await.unwrap();
        age_entry(&f, FEED, 120).await;

        f.transport().fail(FEED, "connection reset");
        let outcome = f.get(FEED, false).await.unwrap();

        let FetchOutcome::Failed { reason, stale } = &outcome else { panic!("expected Failed") };
        assert!(reason.contains("connection reset"));
        assert_eq!(&stale.as_ref().unwrap().payload[..], b"cached");
    }

    #[tokio::test]
    async fn test_unexpected_not_modified_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().not_modified(FEED);

        let outcome = f.get(FEED, false).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Failed { stale: None, .. }));
    }

    #[tokio::test]
    async fn test_cache_only_never_touches_network() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;

        assert_eq!(f.get(FEED, true).await.unwrap(), FetchOutcome::Missing);

        f.transport().ok(FEED, "body", None);
        f.get(FEED, false).await.unwrap();
        age_entry(&f, FEED, 3600).await;

        let outcome = f.get(FEED, true).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::CacheOnly(_)));
        assert_eq!(f.transport().call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_target_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        assert!(matches!(f.get("mailto:someone@example.com", false).await, Err(Error::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_json_parses_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok("https://api.example.com/a", r#"{"count": 3}"#, None);
        f.transport().ok("https://api.example.com/b", "<html>", None);

        let parsed: HashMap<String, u32> = f.json("https://api.example.com/a", HashMap::new()).await.unwrap();
        assert_eq!(parsed.get("count"), Some(&3));

        let fallback: HashMap<String, u32> = f.json("https://api.example.com/b", HashMap::new()).await.unwrap();
        assert!(fallback.is_empty());

        f.transport().fail("https://api.example.com/c", "timeout");
        let missing: Vec<u32> = f.json("https://api.example.com/c", vec![7]).await.unwrap();
        assert_eq!(missing, vec![7]);
    }

    #[tokio::test]
    async fn test_file_writes_payload_with_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok("https://cdn.example.com/ep1.mp3", "ID3", None);

        let dest = out.path().join("ep1.mp3");
        let when = DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z").unwrap().with_timezone(&Utc);
        assert!(f.file("https://cdn.example.com/ep1.mp3", &dest, Some(when)).await.unwrap());

        assert_eq!(std::fs::read(&dest).unwrap(), b"ID3");
        let modified: DateTime<Utc> = std::fs::metadata(&dest).unwrap().modified().unwrap().into();
        assert_eq!(modified.timestamp(), when.timestamp());
        assert!(!out.path().join("ep1.mp3.inprogress").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_file_ignores_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().ok("https://cdn.example.com/ep1.mp3", "cached", Some("\"v1\""));
        f.get("https://cdn.example.com/ep1.mp3", false).await.unwrap();

        f.transport().ok("https://cdn.example.com/ep1.mp3", "fresh", None);
        let dest = out.path().join("ep1.mp3");
        assert!(f.file("https://cdn.example.com/ep1.mp3", &dest, None).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");

        let calls = f.transport().calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1.is_empty());
    }

    #[tokio::test]
    async fn test_file_invalid_target_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        let err = f.file("mailto:someone@example.com", &out.path().join("x"), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
        assert_eq!(f.transport().call_count(), 0);
    }

    #[tokio::test]
    async fn test_file_without_payload_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path()).await;
        f.transport().fail("https://cdn.example.com/ep1.mp3", "refused");

        let dest = out.path().join("ep1.mp3");
        assert!(!f.file("https://cdn.example.com/ep1.mp3", &dest, None).await.unwrap());
        assert!(!dest.exists());
    }
}
