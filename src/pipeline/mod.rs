//! Pipeline orchestration.
//!
//! One `run_once` promotes due retries and then executes the passes in stage
//! order: discovery, fetch, watcher, enrichment. `run_forever` wraps that in
//! a poll loop with cooperative shutdown.

pub mod discovery;
pub mod enrich;
pub mod fetch;
pub mod policy;
pub mod watcher;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::Database;
use crate::error::PipelineError;
use crate::feeds::{RssLister, SourceLister};
use crate::fetcher::{AudioFetcher, YtDlpFetcher};
use crate::llm::{OpenRouterClient, Summarizer};
use policy::RetryPolicy;

pub use discovery::DiscoveryReport;
pub use enrich::EnrichReport;
pub use fetch::FetchReport;
pub use watcher::WatcherReport;

#[derive(Debug, Default)]
pub struct RunReport {
    pub retries_promoted: usize,
    pub discovery: DiscoveryReport,
    pub fetch: FetchReport,
    pub watcher: WatcherReport,
    pub enrich: Option<EnrichReport>,
}

pub struct Pipeline {
    db: Arc<Database>,
    cfg: Config,
    lister: Arc<dyn SourceLister>,
    fetcher: Arc<dyn AudioFetcher>,
    summarizer: Option<Arc<dyn Summarizer>>,
    policy: RetryPolicy,
}

impl Pipeline {
    /// Build with real collaborators. The summarizer is absent when
    /// enrichment is disabled; items then rest at `transcribed`.
    pub fn new(db: Arc<Database>, cfg: Config) -> Result<Self, PipelineError> {
        let lister: Arc<dyn SourceLister> = Arc::new(RssLister::new()?);
        let fetcher: Arc<dyn AudioFetcher> = Arc::new(YtDlpFetcher::new(&cfg.fetch));
        let summarizer: Option<Arc<dyn Summarizer>> = if cfg.llm.enabled {
            Some(Arc::new(OpenRouterClient::new(&cfg.llm)?))
        } else {
            None
        };
        Ok(Self::with_collaborators(db, cfg, lister, fetcher, summarizer))
    }

    /// Build with caller-chosen collaborators; tests pass scripted ones.
    pub fn with_collaborators(
        db: Arc<Database>,
        cfg: Config,
        lister: Arc<dyn SourceLister>,
        fetcher: Arc<dyn AudioFetcher>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        let policy = RetryPolicy::new(&cfg.retry);
        Self {
            db,
            cfg,
            lister,
            fetcher,
            summarizer,
            policy,
        }
    }

    pub async fn run_once(&self, cancel: &CancellationToken) -> anyhow::Result<RunReport> {
        let run_id = uuid::Uuid::new_v4();
        tracing::info!("pipeline run {} starting", run_id);

        let mut report = RunReport::default();

        report.retries_promoted = self.db.promote_due_retries(Utc::now())?;

        report.discovery =
            discovery::run(&self.db, &self.cfg, self.lister.as_ref(), cancel).await?;
        if cancel.is_cancelled() {
            return Ok(report);
        }

        report.fetch = fetch::run(
            &self.db,
            &self.cfg,
            self.fetcher.as_ref(),
            &self.policy,
            cancel,
        )
        .await?;
        if cancel.is_cancelled() {
            return Ok(report);
        }

        report.watcher = watcher::run(&self.db, &self.cfg, cancel).await?;
        if cancel.is_cancelled() {
            return Ok(report);
        }

        if let Some(summarizer) = &self.summarizer {
            report.enrich = Some(
                enrich::run(
                    &self.db,
                    &self.cfg,
                    summarizer.as_ref(),
                    &self.policy,
                    cancel,
                )
                .await?,
            );
        }

        self.db.set_setting("last_run_at", &Utc::now().to_rfc3339())?;

        tracing::info!(
            "pipeline run {} done: {} discovered, {} fetched, {} transcripts, {} enriched",
            run_id,
            report.discovery.registered,
            report.fetch.fetched + report.fetch.skipped_existing,
            report.watcher.stored,
            report.enrich.as_ref().map(|e| e.enriched).unwrap_or(0),
        );

        Ok(report)
    }

    /// Poll loop. Run errors are logged and the loop continues; only
    /// cancellation stops it.
    pub async fn run_forever(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.cfg.poll_interval_secs);
        loop {
            if let Err(e) = self.run_once(&cancel).await {
                tracing::error!("pipeline run failed: {:#}", e);
            }
            if cancel.is_cancelled() {
                break;
            }

            tracing::info!("next pipeline run in {}s", interval.as_secs());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!("pipeline loop stopped");
    }
}
