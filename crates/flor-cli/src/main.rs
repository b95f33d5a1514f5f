use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use flor_feed::FileFeedSource;
use flor_storage::AttachmentStore;
use flor_sync::{connect_repository, FeedIngestRequest, Reconciler, ReconcilerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "flor-cli")]
#[command(about = "Freelance order reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the RSS feed once and merge every entry.
    Ingest {
        #[arg(long)]
        feed_url: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        subcategory: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Read the feed document from disk instead of fetching it.
        #[arg(long)]
        from_file: Option<PathBuf>,
    },
    Migrate,
    Serve,
    /// Print the merged view of one order as JSON.
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ReconcilerConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Ingest {
            feed_url,
            category,
            subcategory,
            limit,
            from_file,
        } => {
            let reconciler = match from_file {
                Some(path) => Reconciler::new(
                    connect_repository(&config).await?,
                    AttachmentStore::new(config.upload_dir.clone()),
                    Arc::new(FileFeedSource::new(path)),
                    config,
                ),
                None => Reconciler::from_config(config).await?,
            };
            let summary = reconciler
                .ingest_feed(&FeedIngestRequest {
                    feed_url,
                    category,
                    subcategory,
                    limit,
                })
                .await?;
            println!(
                "ingest complete: feed={} processed={} created={} updated={} unchanged={} skipped={} filtered_out={} errored={}",
                summary.feed_url,
                summary.processed,
                summary.created,
                summary.updated,
                summary.unchanged,
                summary.skipped,
                summary.filtered_out,
                summary.errored
            );
        }
        Commands::Migrate => {
            flor_sync::run_migrations(&config).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            flor_web::serve(config).await?;
        }
        Commands::Show { id } => {
            let reconciler = Reconciler::from_config(config).await?;
            let order = reconciler.get_merged_order(&id).await?;
            println!("{}", serde_json::to_string_pretty(&order)?);
        }
    }

    Ok(())
}
