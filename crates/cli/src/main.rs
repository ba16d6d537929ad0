//! scrapekit command-line entry point.
//!
//! Results are printed to stdout as JSON. Logging goes to stderr so output
//! can be piped.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scrapekit_core::AppConfig;

mod commands;

#[derive(Parser)]
#[command(name = "scrapekit")]
#[command(about = "Cached conditional fetches and a once-only work ledger", version)]
struct Cli {
    /// Cache directory (overrides SCRAPEKIT_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Ledger database file (overrides SCRAPEKIT_LEDGER_PATH)
    #[arg(long, global = true)]
    ledger_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL through the cache and print the body
    Get {
        url: String,

        /// Never touch the network
        #[arg(long)]
        cache_only: bool,

        /// Print status and validators instead of the body
        #[arg(long)]
        meta: bool,
    },

    /// Fetch a URL and print it as JSON, or `null` when unavailable
    Json { url: String },

    /// Fetch a URL into a local file
    File {
        url: String,
        dest: PathBuf,

        /// Modification time to set (RFC 3339)
        #[arg(long, value_parser = parse_timestamp)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Make sure `{base}.{ext}` exists in DIR for every URL
    Once {
        #[arg(long, short = 'd')]
        dir: PathBuf,

        #[arg(long, short = 'b')]
        base: String,

        /// Modification time to set on written files (RFC 3339)
        #[arg(long, value_parser = parse_timestamp)]
        timestamp: Option<DateTime<Utc>>,

        /// Text for `{base}.txt`, written once
        #[arg(long)]
        description: Option<String>,

        /// Rewrite files that already exist
        #[arg(long)]
        overwrite: bool,

        /// Only report what would be written
        #[arg(long)]
        dry_run: bool,

        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Once-only work ledger
    Ledger {
        #[command(subcommand)]
        action: LedgerCommands,
    },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Record an item; prints whether it was new
    Put { cohort: String, uid: String, payload: String },

    /// Whether an item was ever recorded
    Contains { cohort: String, uid: String },

    /// Keep only the newest entries per cohort
    Cleanup {
        /// Entries kept per cohort (default: retention_limit)
        #[arg(long)]
        limit: Option<usize>,

        /// Only trim this cohort
        #[arg(long)]
        cohort: Option<String>,
    },

    /// List unprocessed entries without marking them
    Pending {
        #[arg(long)]
        newest_first: bool,
    },

    /// Hand each unprocessed entry to a command, marking it done on success
    ///
    /// Without `--exec` entries are printed as JSON lines.
    Drain {
        /// Shell command run per entry with the payload on stdin
        #[arg(long)]
        exec: Option<String>,

        #[arg(long)]
        newest_first: bool,
    },

    /// Mark every entry processed without handing it out
    MarkAllDone,

    /// Entry counts per cohort
    Stats,
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp: {e}"))
}

fn apply_overrides(mut config: AppConfig, cli: &Cli) -> AppConfig {
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(path) = &cli.ledger_path {
        config.ledger_path = path.clone();
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = apply_overrides(AppConfig::load()?, &cli);
    tracing::debug!(cache_dir = %config.cache_dir.display(), ledger = %config.ledger_path.display(), "config loaded");

    let output = match cli.command {
        Commands::Get { url, cache_only, meta } => commands::get(&config, &url, cache_only, meta).await?,
        Commands::Json { url } => commands::json(&config, &url).await?,
        Commands::File { url, dest, timestamp } => commands::file(&config, &url, &dest, timestamp).await?,
        Commands::Once { dir, base, timestamp, description, overwrite, dry_run, urls } => {
            let options = scrapekit_client::OnceOptions { overwrite, dry_run };
            commands::once(&config, &dir, &base, &urls, timestamp, description.as_deref(), options).await?
        }
        Commands::Ledger { action } => commands::ledger(&config, action).await?,
    };

    if let Some(output) = output {
        println!("{output}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_once() {
        let cli = Cli::try_parse_from([
            "scrapekit",
            "once",
            "-d",
            "/tmp/out",
            "-b",
            "ep1",
            "--timestamp",
            "2021-03-04T05:06:07Z",
            "https://a.com/ep1.mp3",
            "https://a.com/cover.jpg",
        ])
        .unwrap();

        match cli.command {
            Commands::Once { dir, base, timestamp, urls, dry_run, .. } => {
                assert_eq!(dir, PathBuf::from("/tmp/out"));
                assert_eq!(base, "ep1");
                assert_eq!(timestamp.unwrap().timestamp(), 1_614_834_367);
                assert_eq!(urls.len(), 2);
                assert!(!dry_run);
            }
            _ => panic!("expected once"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_timestamp() {
        let result = Cli::try_parse_from(["scrapekit", "file", "https://a.com/x", "/tmp/x", "--timestamp", "yesterday"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_overrides() {
        let cli = Cli::try_parse_from(["scrapekit", "ledger", "stats", "--ledger-path", "/tmp/l.sqlite"]).unwrap();
        let config = apply_overrides(AppConfig::default(), &cli);
        assert_eq!(config.ledger_path, PathBuf::from("/tmp/l.sqlite"));
        assert_eq!(config.cache_dir, PathBuf::from("./cache"));
    }
}
