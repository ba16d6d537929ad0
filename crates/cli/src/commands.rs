use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use scrapekit_client::{BatchAcquirer, FetchOutcome, Fetcher, OnceOptions};
use scrapekit_core::ledger::Order;
use scrapekit_core::{AppConfig, LedgerEntry, OnceDb};

use crate::LedgerCommands;

fn status(outcome: &FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::Fresh(_) => "fresh",
        FetchOutcome::Fetched(_) => "fetched",
        FetchOutcome::NotModified(_) => "not_modified",
        FetchOutcome::CacheOnly(_) => "cache_only",
        FetchOutcome::Missing => "missing",
        FetchOutcome::Failed { .. } => "failed",
    }
}

fn describe(outcome: &FetchOutcome) -> Value {
    let reason = match outcome {
        FetchOutcome::Failed { reason, .. } => Some(reason.as_str()),
        _ => None,
    };
    let entry = outcome.entry();
    json!({
        "status": status(outcome),
        "reason": reason,
        "url": entry.map(|e| e.url.as_str()),
        "fingerprint": entry.map(|e| e.fingerprint.to_string()),
        "etag": entry.and_then(|e| e.etag.as_deref()),
        "last_modified": entry.and_then(|e| e.last_modified.as_deref()),
        "content_type": entry.and_then(|e| e.content_type.as_deref()),
        "fetched_at": entry.map(|e| e.fetched_at.to_rfc3339()),
        "bytes": entry.map(|e| e.payload.len()),
    })
}

fn entry_json(entry: &LedgerEntry) -> Value {
    json!({
        "seq": entry.seq,
        "cohort": entry.cohort,
        "uid": entry.uid,
        "payload": entry.payload_str(),
        "inserted_at": entry.inserted_at.to_rfc3339(),
        "processed": entry.processed,
    })
}

async fn open_ledger(config: &AppConfig) -> Result<OnceDb> {
    let db = OnceDb::open(&config.ledger_path)
        .await
        .with_context(|| format!("opening ledger {}", config.ledger_path.display()))?;
    Ok(db.with_page_size(config.page_size))
}

pub async fn get(config: &AppConfig, url: &str, cache_only: bool, meta: bool) -> Result<Option<String>> {
    let fetcher = Fetcher::from_config(config).await?;
    let outcome = fetcher.get(url, cache_only).await?;

    if meta {
        return Ok(Some(describe(&outcome).to_string()));
    }
    match outcome.payload() {
        Some(payload) => Ok(Some(String::from_utf8_lossy(payload).into_owned())),
        None => bail!("no content for {url}: {}", describe(&outcome)),
    }
}

pub async fn json(config: &AppConfig, url: &str) -> Result<Option<String>> {
    let fetcher = Fetcher::from_config(config).await?;
    let value: Value = fetcher.json(url, Value::Null).await?;
    Ok(Some(value.to_string()))
}

pub async fn file(
    config: &AppConfig, url: &str, dest: &Path, timestamp: Option<DateTime<Utc>>,
) -> Result<Option<String>> {
    let fetcher = Fetcher::from_config(config).await?;
    if !fetcher.file(url, dest, timestamp).await? {
        bail!("no content for {url}");
    }
    Ok(Some(json!({ "written": dest }).to_string()))
}

pub async fn once(
    config: &AppConfig, dir: &Path, base: &str, urls: &[String], timestamp: Option<DateTime<Utc>>,
    description: Option<&str>, options: OnceOptions,
) -> Result<Option<String>> {
    tokio::fs::create_dir_all(dir).await?;
    let fetcher = Fetcher::from_config(config).await?;
    let targets: Vec<&str> = urls.iter().map(String::as_str).collect();

    let report = BatchAcquirer::new(&fetcher)
        .with_options(options)
        .once(dir, base, &targets, timestamp, description)
        .await?;

    let failed: Vec<Value> =
        report.failed.iter().map(|f| json!({ "target": f.target, "reason": f.reason })).collect();
    Ok(Some(
        json!({
            "written": report.written,
            "skipped": report.skipped,
            "failed": failed,
            "description": report.description,
            "dry_run": report.dry_run,
            "updated": report.did_update(),
        })
        .to_string(),
    ))
}

async fn run_hook(command: &str, entry: LedgerEntry) -> Result<(), String> {
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("SCRAPEKIT_COHORT", &entry.cohort)
        .env("SCRAPEKIT_UID", &entry.uid)
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| format!("spawn failed: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(&entry.payload).await {
            Ok(()) => {}
            // the command may exit without reading its input; its status decides
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(format!("writing payload: {e}")),
        }
    }

    let status = child.wait().await.map_err(|e| format!("wait failed: {e}"))?;
    if status.success() { Ok(()) } else { Err(format!("command exited with {status}")) }
}

pub async fn ledger(config: &AppConfig, action: LedgerCommands) -> Result<Option<String>> {
    let db = open_ledger(config).await?;

    let output = match action {
        LedgerCommands::Put { cohort, uid, payload } => {
            let inserted = db.put(&cohort, &uid, payload).await?;
            json!({ "inserted": inserted })
        }
        LedgerCommands::Contains { cohort, uid } => json!({ "contains": db.contains(&cohort, &uid).await? }),
        LedgerCommands::Cleanup { limit, cohort } => {
            let limit = limit.unwrap_or(config.retention_limit);
            let removed = match cohort {
                Some(cohort) => db.cleanup_cohort(&cohort, limit).await?,
                None => db.cleanup(limit).await?,
            };
            json!({ "removed": removed })
        }
        LedgerCommands::Pending { newest_first } => {
            let order = if newest_first { Order::NewestFirst } else { Order::OldestFirst };
            let mut cursor = db.pending_in(order);
            let mut entries = Vec::new();
            while let Some(entry) = cursor.next().await? {
                entries.push(entry_json(&entry));
            }
            Value::Array(entries)
        }
        LedgerCommands::Drain { exec, newest_first } => {
            let outcome = match exec.as_deref() {
                Some(command) if newest_first => db.foreach_rev(|entry| run_hook(command, entry)).await?,
                Some(command) => db.foreach(|entry| run_hook(command, entry)).await?,
                None => {
                    let print = |entry: LedgerEntry| {
                        println!("{}", entry_json(&entry));
                        async { Ok::<(), std::convert::Infallible>(()) }
                    };
                    if newest_first { db.foreach_rev(print).await? } else { db.foreach(print).await? }
                }
            };
            let processed = outcome.into_result()?;
            json!({ "processed": processed })
        }
        LedgerCommands::MarkAllDone => json!({ "marked": db.mark_all_done().await? }),
        LedgerCommands::Stats => serde_json::to_value(db.cohort_stats().await?)?,
    };

    db.close().await?;
    Ok(Some(output.to_string()))
}
