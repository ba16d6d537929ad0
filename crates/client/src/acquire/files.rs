//! Destination-file helpers: in-progress writes, write-once, modification times.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use scrapekit_core::Error;

const IN_PROGRESS_SUFFIX: &str = ".inprogress";

fn in_progress_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(IN_PROGRESS_SUFFIX);
    PathBuf::from(name)
}

/// Set the modification (and access) time of `path`.
pub async fn set_mtime(path: &Path, when: DateTime<Utc>) -> Result<(), Error> {
    let path = path.to_path_buf();
    let time = SystemTime::from(when);
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_times(std::fs::FileTimes::new().set_accessed(time).set_modified(time))
    })
    .await
    .map_err(|e| Error::Storage(std::io::Error::other(e)))??;
    Ok(())
}

/// Write `bytes` to `dest` via `dest.inprogress`, so `dest` only ever appears
/// complete. The modification time is applied before the rename.
pub async fn write_file(dest: &Path, bytes: &[u8], mtime: Option<DateTime<Utc>>) -> Result<(), Error> {
    let tmp = in_progress_path(dest);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Some(when) = mtime {
            set_mtime(&tmp, when).await?;
        }
        tokio::fs::rename(&tmp, dest).await?;
        Ok::<(), Error>(())
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

/// Write the text produced by `produce` to `path`, unless `path` already exists.
///
/// `produce` is only called when the file is missing. Returns whether the
/// file was written.
pub async fn write_once<F>(path: &Path, timestamp: Option<DateTime<Utc>>, produce: F) -> Result<bool, Error>
where
    F: FnOnce() -> String,
{
    if tokio::fs::try_exists(path).await? {
        return Ok(false);
    }
    write_file(path, produce().as_bytes(), timestamp).await?;
    tracing::info!(path = %path.display(), "wrote sidecar file");
    Ok(true)
}
