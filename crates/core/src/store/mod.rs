//! On-disk content store for downloaded payloads.
//!
//! Each entry is a pair of files under the cache directory:
//!
//! - `{fingerprint}.data` holds the raw payload
//! - `{fingerprint}.meta.json` holds validators, fetch time and a payload digest
//!
//! Both files are replaced with write-to-temp-then-rename. The payload is
//! renamed first, so a reader racing a writer can observe a new payload next
//! to old metadata; the digest check turns that torn pair into a miss instead
//! of serving mismatched content.

pub mod fingerprint;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::Error;
pub use fingerprint::{Fingerprint, canonicalize};
use fingerprint::payload_digest;

const DATA_SUFFIX: &str = ".data";
const META_SUFFIX: &str = ".meta.json";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A cached response body plus the metadata needed to revalidate it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub url: String,
    pub payload: Bytes,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry carries anything usable for a conditional request.
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// Age of the entry relative to `now`; negative ages clamp to zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Serialized form of the `.meta.json` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    etag: Option<String>,
    last_modified: Option<String>,
    content_type: Option<String>,
    fetched_at: DateTime<Utc>,
    size: u64,
    digest: String,
}

/// Handle to a cache directory.
///
/// Handles are cheap; every worker should open its own. Consistency across
/// handles comes from atomic renames on the shared directory.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) the cache directory at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(format!("{fp}{DATA_SUFFIX}"))
    }

    fn meta_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join(format!("{fp}{META_SUFFIX}"))
    }

    async fn read_meta(&self, fp: &Fingerprint) -> Result<Option<EntryMeta>, Error> {
        let raw = match tokio::fs::read(self.meta_path(fp)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                tracing::warn!(fingerprint = %fp, error = %e, "unreadable cache metadata, treating as miss");
                Ok(None)
            }
        }
    }

    /// Look up an entry. Missing, unparsable or torn entries are `None`.
    pub async fn get(&self, fp: &Fingerprint) -> Result<Option<CacheEntry>, Error> {
        let Some(meta) = self.read_meta(fp).await? else {
            return Ok(None);
        };

        let payload = match tokio::fs::read(self.data_path(fp)).await {
            Ok(payload) => payload,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(fingerprint = %fp, "cache metadata without payload, treating as miss");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if payload.len() as u64 != meta.size || payload_digest(&payload) != meta.digest {
            tracing::warn!(fingerprint = %fp, "cache payload does not match its digest, treating as miss");
            return Ok(None);
        }

        Ok(Some(CacheEntry {
            fingerprint: fp.clone(),
            url: meta.url,
            payload: Bytes::from(payload),
            etag: meta.etag,
            last_modified: meta.last_modified,
            content_type: meta.content_type,
            fetched_at: meta.fetched_at,
        }))
    }

    /// Replace the entry for `entry.fingerprint` wholesale.
    pub async fn put(&self, entry: &CacheEntry) -> Result<(), Error> {
        let meta = EntryMeta {
            url: entry.url.clone(),
            etag: entry.etag.clone(),
            last_modified: entry.last_modified.clone(),
            content_type: entry.content_type.clone(),
            fetched_at: entry.fetched_at,
            size: entry.payload.len() as u64,
            digest: payload_digest(&entry.payload),
        };
        let meta_json = serde_json::to_vec_pretty(&meta)?;

        write_atomic(&self.data_path(&entry.fingerprint), &entry.payload).await?;
        write_atomic(&self.meta_path(&entry.fingerprint), &meta_json).await?;

        tracing::debug!(
            fingerprint = %entry.fingerprint,
            bytes = entry.payload.len(),
            etag = entry.etag.as_deref().unwrap_or(""),
            "stored cache entry"
        );
        Ok(())
    }

    /// Move an entry's fetch time forward without touching its payload.
    ///
    /// Returns `false` when there is no entry to refresh.
    pub async fn touch(&self, fp: &Fingerprint, fetched_at: DateTime<Utc>) -> Result<bool, Error> {
        let Some(mut meta) = self.read_meta(fp).await? else {
            return Ok(false);
        };
        meta.fetched_at = fetched_at;
        write_atomic(&self.meta_path(fp), &serde_json::to_vec_pretty(&meta)?).await?;
        Ok(true)
    }

    /// True if a valid entry exists and was fetched less than `window` ago.
    ///
    /// Goes through [`ContentStore::get`], so a torn or corrupt entry is never fresh.
    pub async fn is_fresh(&self, fp: &Fingerprint, window: Duration) -> Result<bool, Error> {
        Ok(self
            .get(fp)
            .await?
            .is_some_and(|entry| entry.age(Utc::now()) < window))
    }

    /// Delete one entry. Returns whether anything was removed.
    pub async fn remove(&self, fp: &Fingerprint) -> Result<bool, Error> {
        let meta = remove_if_exists(&self.meta_path(fp)).await?;
        let data = remove_if_exists(&self.data_path(fp)).await?;
        Ok(meta || data)
    }

    /// Delete entries whose last fetch is older than `age`.
    ///
    /// Never called by the fetcher; retention of the content cache is left to
    /// whoever owns the cache directory.
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64, Error> {
        let Some(cutoff) = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let mut deleted = 0u64;

        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };
            let fp = Fingerprint(stem.to_string());
            match self.read_meta(&fp).await? {
                Some(meta) if meta.fetched_at < cutoff => {
                    self.remove(&fp).await?;
                    deleted += 1;
                }
                _ => {}
            }
        }

        tracing::info!(deleted, "purged stale cache entries");
        Ok(deleted)
    }
}

async fn remove_if_exists(path: &Path) -> Result<bool, Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Write `bytes` to a sibling temp file, flush it, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Storage(std::io::Error::new(ErrorKind::InvalidInput, "path has no file name")))?;
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
