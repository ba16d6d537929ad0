//! Batch acquisition of named local files.
//!
//! Given a destination directory, a base name and a list of targets, make sure
//! `{base_name}.{ext}` exists for each target. Files already on disk are left
//! alone (content and modification time), so re-running a partially completed
//! batch only fills the gaps.

pub mod files;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use url::Url;

use scrapekit_core::Error;
use scrapekit_core::store::canonicalize;

use crate::fetch::Transport;
use crate::fetcher::Fetcher;
pub use files::{set_mtime, write_file, write_once};

/// Extension used when a target's path has none.
pub const UNKNOWN_EXTENSION: &str = "unknown";

/// Knobs carried over from interactive use.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnceOptions {
    /// Re-download and rewrite files that already exist.
    pub overwrite: bool,
    /// Report what would be written without touching the network or disk.
    pub dry_run: bool,
}

/// A target that could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub target: String,
    pub reason: String,
}

/// What one batch did.
#[derive(Debug, Clone, Default)]
pub struct OnceReport {
    /// Files written in this run (or that would be, on a dry run).
    pub written: Vec<PathBuf>,
    /// Destinations that already existed.
    pub skipped: Vec<PathBuf>,
    /// Targets that failed; the rest of the batch still ran.
    pub failed: Vec<TargetFailure>,
    /// Description file, if this run created it.
    pub description: Option<PathBuf>,
    pub dry_run: bool,
}

impl OnceReport {
    /// Whether anything new landed (or would land) on disk.
    pub fn did_update(&self) -> bool {
        !self.written.is_empty() || self.description.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// File extension for a target URL: the last path segment's extension,
/// lowercased and stripped to ASCII alphanumerics.
pub fn extension_of(url: &Url) -> String {
    let ext: String = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();

    if ext.is_empty() { UNKNOWN_EXTENSION.to_string() } else { ext }
}

/// Orchestrates "fetch if absent" for a set of destination files.
pub struct BatchAcquirer<'a, T: Transport> {
    fetcher: &'a Fetcher<T>,
    options: OnceOptions,
}

impl<'a, T: Transport> BatchAcquirer<'a, T> {
    pub fn new(fetcher: &'a Fetcher<T>) -> Self {
        Self { fetcher, options: OnceOptions::default() }
    }

    pub fn with_options(mut self, options: OnceOptions) -> Self {
        self.options = options;
        self
    }

    async fn needs_write(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.options.overwrite || !tokio::fs::try_exists(path).await?)
    }

    /// Acquire every target as `{dest_dir}/{base_name}.{ext}`.
    ///
    /// Every file written gets `timestamp` as its modification time. When
    /// `description` is given it goes to `{base_name}.txt`, once.
    ///
    /// Invalid targets and network failures are collected in
    /// [`OnceReport::failed`]; filesystem errors abort the batch.
    pub async fn once(
        &self, dest_dir: &Path, base_name: &str, targets: &[&str], timestamp: Option<DateTime<Utc>>,
        description: Option<&str>,
    ) -> Result<OnceReport, Error> {
        let mut report = OnceReport { dry_run: self.options.dry_run, ..Default::default() };

        for target in targets {
            let url = match canonicalize(target) {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!(%target, error = %e, "skipping invalid target");
                    report.failed.push(TargetFailure { target: target.to_string(), reason: e.to_string() });
                    continue;
                }
            };

            let dest = dest_dir.join(format!("{base_name}.{}", extension_of(&url)));
            if !self.needs_write(&dest).await? {
                tracing::debug!(path = %dest.display(), "already present");
                report.skipped.push(dest);
                continue;
            }

            tracing::info!(url = %url, path = %dest.display(), dry_run = self.options.dry_run, "downloading");
            if self.options.dry_run {
                report.written.push(dest);
                continue;
            }

            if self.fetcher.file(url.as_str(), &dest, timestamp).await? {
                report.written.push(dest);
            } else {
                report.failed.push(TargetFailure { target: target.to_string(), reason: "no content available".into() });
            }
        }

        if let Some(text) = description {
            let path = dest_dir.join(format!("{base_name}.txt"));
            let wrote = if self.options.dry_run {
                self.needs_write(&path).await?
            } else if self.options.overwrite {
                write_file(&path, text.as_bytes(), timestamp).await?;
                true
            } else {
                write_once(&path, timestamp, || text.to_string()).await?
            };
            if wrote {
                report.description = Some(path);
            }
        }

        if !report.is_complete() {
            tracing::warn!(base_name, failed = report.failed.len(), "batch finished with failures");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::ScriptedTransport;
    use scrapekit_core::ContentStore;

    const AUDIO: &str = "https://cdn.example.com/show/ep1.MP3?token=abc";
    const IMAGE: &str = "https://cdn.example.com/show/cover.jpg";

    struct Env {
        cache: tempfile::TempDir,
        out: tempfile::TempDir,
        fetcher: Fetcher<ScriptedTransport>,
    }

    async fn env() -> Env {
        let cache = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let store = ContentStore::open(cache.path()).await.unwrap();
        Env { fetcher: Fetcher::new(store, ScriptedTransport::new()), cache, out }
    }

    fn when() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2021-03-04T05:06:07Z").unwrap().with_timezone(&Utc)
    }

    fn mtime(path: &Path) -> std::time::SystemTime {
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn test_extension_of() {
        let ext = |s: &str| extension_of(&Url::parse(s).unwrap());
        assert_eq!(ext("https://a.com/x/ep1.MP3?q=1"), "mp3");
        assert_eq!(ext("https://a.com/x/cover.jpg"), "jpg");
        assert_eq!(ext("https://a.com/x/download"), "unknown");
        assert_eq!(ext("https://a.com/"), "unknown");
        assert_eq!(ext("https://a.com/archive.tar.gz"), "gz");
    }

    #[tokio::test]
    async fn test_once_writes_all_with_timestamp() {
        let env = env().await;
        env.fetcher.transport().ok(AUDIO, "audio", None);
        env.fetcher.transport().ok(IMAGE, "image", None);

        let report = env
            .fetcher
            .once(env.out.path(), "2021-03-04 - Ep1", &[AUDIO, IMAGE], Some(when()), Some("Ep1\n===\n"))
            .await
            .unwrap();

        let mp3 = env.out.path().join("2021-03-04 - Ep1.mp3");
        let jpg = env.out.path().join("2021-03-04 - Ep1.jpg");
        let txt = env.out.path().join("2021-03-04 - Ep1.txt");
        assert_eq!(report.written, vec![mp3.clone(), jpg.clone()]);
        assert_eq!(report.description, Some(txt.clone()));
        assert!(report.did_update());
        assert!(report.is_complete());

        for path in [&mp3, &jpg, &txt] {
            let modified: DateTime<Utc> = mtime(path).into();
            assert_eq!(modified.timestamp(), when().timestamp());
        }
        assert_eq!(std::fs::read_to_string(&txt).unwrap(), "Ep1\n===\n");
        assert_eq!(std::fs::read_dir(env.cache.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_once_skips_existing_files() {
        let env = env().await;
        let mp3 = env.out.path().join("ep1.mp3");
        std::fs::write(&mp3, b"already here").unwrap();
        let before = mtime(&mp3);

        env.fetcher.transport().ok(IMAGE, "image", None);
        let report = env.fetcher.once(env.out.path(), "ep1", &[AUDIO, IMAGE], Some(when()), None).await.unwrap();

        assert_eq!(report.skipped, vec![mp3.clone()]);
        assert_eq!(report.written, vec![env.out.path().join("ep1.jpg")]);
        assert_eq!(std::fs::read(&mp3).unwrap(), b"already here");
        assert_eq!(mtime(&mp3), before);

        let calls = env.fetcher.transport().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, IMAGE);
    }

    #[tokio::test]
    async fn test_once_resumes_after_partial_failure() {
        let env = env().await;
        env.fetcher.transport().ok(AUDIO, "audio", None);
        env.fetcher.transport().fail(IMAGE, "connection reset");

        let first = env.fetcher.once(env.out.path(), "ep1", &[AUDIO, IMAGE], None, None).await.unwrap();
        assert_eq!(first.written.len(), 1);
        assert_eq!(first.failed.len(), 1);
        assert_eq!(first.failed[0].target, IMAGE);
        assert!(first.failed[0].reason.contains("no content"));

        env.fetcher.transport().ok(IMAGE, "image", None);
        let second = env.fetcher.once(env.out.path(), "ep1", &[AUDIO, IMAGE], None, None).await.unwrap();
        assert_eq!(second.skipped, vec![env.out.path().join("ep1.mp3")]);
        assert_eq!(second.written, vec![env.out.path().join("ep1.jpg")]);
        assert_eq!(env.fetcher.transport().call_count(), 3);
    }

    #[tokio::test]
    async fn test_once_records_invalid_target_and_continues() {
        let env = env().await;
        env.fetcher.transport().ok(IMAGE, "image", None);

        let report = env.fetcher.once(env.out.path(), "ep1", &["ftp://nope/x.mp3", IMAGE], None, None).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].target, "ftp://nope/x.mp3");
        assert_eq!(report.written.len(), 1);
    }

    #[tokio::test]
    async fn test_description_written_once() {
        let env = env().await;
        let txt = env.out.path().join("ep1.txt");
        std::fs::write(&txt, "original").unwrap();

        let report = env.fetcher.once(env.out.path(), "ep1", &[], None, Some("replacement")).await.unwrap();
        assert!(report.description.is_none());
        assert!(!report.did_update());
        assert_eq!(std::fs::read_to_string(&txt).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let env = env().await;
        let report = BatchAcquirer::new(&env.fetcher)
            .with_options(OnceOptions { dry_run: true, ..Default::default() })
            .once(env.out.path(), "ep1", &[AUDIO], None, Some("desc"))
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.written, vec![env.out.path().join("ep1.mp3")]);
        assert!(report.description.is_some());
        assert_eq!(env.fetcher.transport().call_count(), 0);
        assert!(!env.out.path().join("ep1.mp3").exists());
        assert!(!env.out.path().join("ep1.txt").exists());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_existing() {
        let env = env().await;
        let mp3 = env.out.path().join("ep1.mp3");
        std::fs::write(&mp3, b"old").unwrap();
        env.fetcher.transport().ok(AUDIO, "new", None);

        let report = BatchAcquirer::new(&env.fetcher)
            .with_options(OnceOptions { overwrite: true, ..Default::default() })
            .once(env.out.path(), "ep1", &[AUDIO], None, None)
            .await
            .unwrap();

        assert_eq!(report.written, vec![mp3.clone()]);
        assert_eq!(std::fs::read(&mp3).unwrap(), b"new");
    }
}
