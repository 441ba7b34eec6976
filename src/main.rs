//! tubescribe CLI entrypoint

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tubescribe::config::Config;
use tubescribe::database::{ChannelStatus, Database};
use tubescribe::llm::{Chapter, OpenRouterClient, Summarizer};
use tubescribe::pipeline::Pipeline;

/// tubescribe - turn monitored channels into transcribed, summarized notes
#[derive(Parser, Debug)]
#[command(name = "tubescribe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(
        short,
        long,
        env = "TUBESCRIBE_CONFIG",
        default_value = "config.yaml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline on its poll interval until interrupted
    Run,

    /// Execute a single pipeline cycle and exit
    Once,

    /// Show stage counts and store totals
    Status {
        /// Recompute cached per-channel counters first
        #[arg(long)]
        recount: bool,
    },

    /// List monitored channels
    Channels,

    /// Pause polling for a channel
    Pause {
        /// Channel id (the UC... key)
        channel: String,
    },

    /// Resume polling for a paused channel
    Resume {
        /// Channel id (the UC... key)
        channel: String,
    },

    /// Reset a failed or abandoned item so the pipeline picks it up again
    Reset {
        /// Video id (natural key)
        video: String,

        /// Drop back to fetched so the next transcript file stores as a new version
        #[arg(long)]
        to_fetched: bool,
    },

    /// Semantic search over stored transcripts
    Search {
        /// Search query
        query: String,

        /// Maximum number of hits to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show one item with its transcript and enrichment
    Show {
        /// Video id (natural key)
        video: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let cfg = Config::load(&cli.config)?;
    for dir in [&cfg.data_dir, &cfg.audio_dir, &cfg.transcript_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let db = Arc::new(Database::new(&cfg.database_path)?);

    // Bring configured channels into the registry
    for channel in &cfg.channels {
        let (_, is_new) = db.sync_channel(&channel.id, &channel.name)?;
        if is_new {
            tracing::info!("added channel {} ({})", channel.name, channel.id);
        }
    }

    match cli.command {
        Commands::Run => {
            let pipeline = Pipeline::new(db, cfg)?;
            let cancel = CancellationToken::new();
            let handle = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    handle.cancel();
                }
            });
            pipeline.run_forever(cancel).await;
        }

        Commands::Once => {
            let pipeline = Pipeline::new(db, cfg)?;
            let report = pipeline.run_once(&CancellationToken::new()).await?;
            println!(
                "registered {} new, fetched {}, stored {} transcripts, enriched {}",
                report.discovery.registered,
                report.fetch.fetched + report.fetch.skipped_existing,
                report.watcher.stored,
                report.enrich.as_ref().map(|e| e.enriched).unwrap_or(0)
            );
        }

        Commands::Status { recount } => {
            if recount {
                db.recount_channel_counters()?;
            }
            let counts = db.stage_counts()?;
            if counts.is_empty() {
                println!("no items tracked yet");
            } else {
                println!("{:<15} {:>6}", "stage", "count");
                for (stage, count) in counts {
                    println!("{:<15} {:>6}", stage, count);
                }
            }
            let (transcripts, enrichments) = db.store_totals()?;
            println!("\n{} transcripts, {} enrichments stored", transcripts, enrichments);
            if let Some(last) = db.get_setting("last_run_at")? {
                println!("last run: {}", last);
            }
        }

        Commands::Channels => {
            for ch in db.get_channels()? {
                println!(
                    "{:<26} {:<8} found {:>4}  processed {:>4}  {}",
                    ch.channel_id,
                    ch.status.as_str(),
                    ch.videos_found,
                    ch.videos_processed,
                    ch.name
                );
            }
        }

        Commands::Pause { channel } => {
            if db.set_channel_status(&channel, ChannelStatus::Paused)? {
                println!("paused {}", channel);
            } else {
                bail!("no channel with id {}", channel);
            }
        }

        Commands::Resume { channel } => {
            if db.set_channel_status(&channel, ChannelStatus::Active)? {
                println!("resumed {}", channel);
            } else {
                bail!("no channel with id {}", channel);
            }
        }

        Commands::Reset { video, to_fetched } => match db.reset_video(&video, to_fetched)? {
            Some(stage) => println!("{} reset to {}", video, stage),
            None => bail!("{} is not eligible for a reset (unknown id or wrong stage)", video),
        },

        Commands::Search { query, limit } => {
            if !cfg.llm.enabled {
                bail!("semantic search needs llm.enabled: true");
            }
            if cfg.llm.embedding_model.is_none() {
                bail!("semantic search needs llm.embedding_model set");
            }
            let client = OpenRouterClient::new(&cfg.llm)?;
            let vector = client
                .embed(&query)
                .await?
                .context("embedding model returned nothing")?;
            let hits = db.semantic_search(&vector, limit)?;
            if hits.is_empty() {
                println!("no matches");
            }
            for hit in hits {
                println!("{:.3}  {:<14} {}", hit.score, hit.video_id, hit.title);
            }
        }

        Commands::Show { video } => {
            let item = db
                .get_video_by_natural_key(&video)?
                .with_context(|| format!("no item with id {}", video))?;

            println!("{} ({})", item.title, item.video_id);
            println!("  url:        {}", item.url);
            match item.failed_from {
                Some(from) => println!("  stage:      {} (fell from {})", item.stage, from),
                None => println!("  stage:      {}", item.stage),
            }
            if let Some(err) = &item.last_error {
                println!("  last error: {} ({} attempts)", err, item.attempts);
            }
            if let Some(next) = &item.next_retry_at {
                println!("  next retry: {}", next);
            }
            if let Some(path) = &item.audio_path {
                println!("  audio:      {}", path);
            }

            if let Some(t) = db.get_transcript_for_video(item.id)? {
                println!(
                    "  transcript: v{} via {}, {} words{}",
                    t.version,
                    t.engine,
                    t.word_count,
                    if t.embedding.is_some() { ", embedded" } else { "" }
                );
            }

            if let Some(e) = db.get_enrichment_for_video(item.id)? {
                println!("\n{}", e.summary);
                let chapters: Vec<Chapter> =
                    serde_json::from_str(&e.chapters_json).unwrap_or_default();
                if !chapters.is_empty() {
                    println!("\nchapters:");
                    for ch in chapters {
                        match ch.timestamp {
                            Some(ts) => println!("  [{}] {}", ts, ch.title),
                            None => println!("  {}", ch.title),
                        }
                    }
                }
                let points: Vec<String> =
                    serde_json::from_str(&e.key_points_json).unwrap_or_default();
                if !points.is_empty() {
                    println!("\nkey points:");
                    for p in points {
                        println!("  - {}", p);
                    }
                }
            }
        }
    }

    Ok(())
}
