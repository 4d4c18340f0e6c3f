use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use permit_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "permit-cli")]
#[command(about = "Incremental sync of NYC DOT street-work permits and their PDFs")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync pass
    Sync {
        #[command(flatten)]
        args: SyncArgs,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a sync on every tick of a cron schedule until interrupted
    Schedule {
        #[command(flatten)]
        args: SyncArgs,

        #[arg(long, env = "PERMIT_SYNC_CRON", default_value = "0 6 * * *")]
        cron: String,
    },
    /// Create or upgrade the Postgres schema
    Migrate {
        #[arg(long, env = "PERMIT_STORE")]
        store: String,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Permit search endpoint
    #[arg(long, env = "PERMIT_SEARCH_URL")]
    url: String,

    /// Record store: postgres://..., memory: or a JSON file path
    #[arg(long, env = "PERMIT_STORE")]
    store: String,

    /// Permit PDF endpoint
    #[arg(long, env = "PERMIT_DOCUMENT_URL")]
    document_url: Option<String>,

    /// Blob target: http(s) bucket endpoint or local directory
    #[arg(long, env = "PERMIT_BLOBS", default_value = "./artifacts")]
    blobs: String,

    /// Base URL recorded for archived PDFs
    #[arg(long, env = "PERMIT_BLOB_PUBLIC_URL")]
    blob_public_url: Option<String>,

    #[arg(long, env = "PERMIT_BLOB_TOKEN", hide_env_values = true)]
    blob_token: Option<String>,

    /// Window start (YYYY-MM-DD or MM/DD/YYYY); required when the store is empty
    #[arg(long, value_parser = parse_since)]
    since: Option<NaiveDate>,

    /// Read search pages and PDFs from a fixture directory instead of the network
    #[arg(long, env = "PERMIT_FIXTURES_DIR")]
    fixtures: Option<PathBuf>,

    #[arg(long, env = "PERMIT_PAGE_SIZE")]
    page_size: Option<u32>,

    #[arg(long, env = "PERMIT_USER_AGENT")]
    user_agent: Option<String>,

    #[arg(long, env = "PERMIT_HTTP_TIMEOUT_SECS")]
    http_timeout_secs: Option<u64>,
}

impl SyncArgs {
    fn into_config(self) -> SyncConfig {
        let mut config = SyncConfig::new(self.url, self.store);
        config.blobs = self.blobs;
        config.blob_public_base_url = self.blob_public_url;
        config.blob_token = self.blob_token;
        config.since = self.since;
        config.fixtures_dir = self.fixtures;
        if let Some(document_url) = self.document_url {
            config.document_url = document_url;
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size;
        }
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }
        if let Some(secs) = self.http_timeout_secs {
            config.http_timeout_secs = secs;
        }
        config
    }
}

fn parse_since(input: &str) -> Result<NaiveDate, String> {
    permit_core::parse_date(input).map_err(|err| format!("expected YYYY-MM-DD or MM/DD/YYYY ({err})"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync { args, json } => {
            let config = args.into_config();
            let summary = permit_sync::run_sync_once(&config).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                println!(
                    "sync complete: run_id={} window={}..{} pages={} seen={} created={} touched={} pdfs_archived={}",
                    summary.run_id,
                    summary.window.from,
                    summary.window.to,
                    summary.pages_fetched,
                    summary.counts.records_seen,
                    summary.counts.created,
                    summary.counts.touched,
                    summary.counts.pdfs_archived
                );
            }
        }
        Commands::Schedule { args, cron } => {
            let mut config = args.into_config();
            config.sync_cron = cron;
            let mut sched = permit_sync::build_scheduler(&config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate { store } => {
            if permit_sync::migrate_store(&store).await? {
                println!("migrations applied");
            } else {
                eprintln!("store {store} has no schema to migrate");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_args_fill_config_overrides() {
        let cli = Cli::try_parse_from([
            "permit-cli",
            "sync",
            "--url",
            "https://nycstreets.net/Public/Permit/SearchPermits",
            "--store",
            "memory:",
            "--since",
            "04/02/2018",
            "--page-size",
            "50",
        ])
        .expect("parse");
        let Commands::Sync { args, json } = cli.command else {
            panic!("expected sync");
        };
        assert!(!json);
        let config = args.into_config();
        assert_eq!(config.store, "memory:");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.since, NaiveDate::from_ymd_opt(2018, 4, 2));
        assert_eq!(config.blobs, "./artifacts");
    }

    #[test]
    fn bad_since_is_rejected() {
        let result = Cli::try_parse_from([
            "permit-cli",
            "sync",
            "--url",
            "https://example.test",
            "--store",
            "memory:",
            "--since",
            "last tuesday",
        ]);
        assert!(result.is_err());
    }
}
