//! Fetch pass: claim discovered items and download their audio.
//!
//! Claiming is a compare-and-swap from `discovered` to `fetch_pending`, so
//! when two runs race over the same item exactly one downloads it and the
//! other skips. Downloads run with bounded parallelism.

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::{AdvanceOutcome, Database, FailOutcome, Stage, Video};
use crate::fetcher::AudioFetcher;
use crate::pipeline::policy::RetryPolicy;

#[derive(Debug, Default)]
pub struct FetchReport {
    pub attempted: usize,
    pub fetched: usize,
    pub skipped_existing: usize,
    pub stale: usize,
    pub failed: usize,
    pub abandoned: usize,
}

enum ItemOutcome {
    Fetched,
    SkippedExisting,
    Stale,
    Failed,
    Abandoned,
    Cancelled,
}

pub async fn run(
    db: &Database,
    cfg: &Config,
    fetcher: &dyn AudioFetcher,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> anyhow::Result<FetchReport> {
    let worklist = db.fetch_worklist()?;

    let outcomes = stream::iter(worklist)
        .map(|video| process_one(db, cfg, fetcher, policy, cancel, video))
        .buffer_unordered(cfg.fetch.max_concurrent)
        .collect::<Vec<_>>()
        .await;

    let mut report = FetchReport::default();
    for outcome in outcomes {
        match outcome? {
            ItemOutcome::Fetched => {
                report.attempted += 1;
                report.fetched += 1;
            }
            ItemOutcome::SkippedExisting => {
                report.attempted += 1;
                report.skipped_existing += 1;
            }
            ItemOutcome::Stale => {
                report.attempted += 1;
                report.stale += 1;
            }
            ItemOutcome::Failed => {
                report.attempted += 1;
                report.failed += 1;
            }
            ItemOutcome::Abandoned => {
                report.attempted += 1;
                report.abandoned += 1;
            }
            ItemOutcome::Cancelled => {}
        }
    }
    Ok(report)
}

async fn process_one(
    db: &Database,
    cfg: &Config,
    fetcher: &dyn AudioFetcher,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    video: Video,
) -> anyhow::Result<ItemOutcome> {
    if cancel.is_cancelled() {
        return Ok(ItemOutcome::Cancelled);
    }

    // Natural keys become file names; refuse anything that could escape
    // the audio directory.
    if !is_safe_key(&video.video_id) {
        tracing::warn!("video {} has an unsafe natural key, parking it", video.id);
        let outcome = db.mark_failed(
            video.id,
            video.stage,
            "video id contains unsafe characters",
            false,
            policy,
        )?;
        return Ok(fold_fail(outcome));
    }

    // Claim. Items already at fetch_pending were claimed by a run that died
    // mid-download; take them over as-is.
    if video.stage == Stage::Discovered {
        match db.advance(video.id, Stage::Discovered, Stage::FetchPending)? {
            AdvanceOutcome::Advanced => {}
            AdvanceOutcome::Stale { actual } => {
                tracing::debug!("video {} already claimed (now {})", video.video_id, actual);
                return Ok(ItemOutcome::Stale);
            }
        }
    }

    let dest = cfg
        .audio_dir
        .join(format!("{}.{}", video.video_id, cfg.fetch.audio_format));

    if dest.exists() {
        // Artifact survives from an earlier run; no need to download again
        db.record_artifact(video.id, &dest.to_string_lossy())?;
        return match db.advance(video.id, Stage::FetchPending, Stage::Fetched)? {
            AdvanceOutcome::Advanced => {
                db.increment_channel_processed(video.channel_id)?;
                tracing::info!("audio already present for {}", video.video_id);
                Ok(ItemOutcome::SkippedExisting)
            }
            AdvanceOutcome::Stale { .. } => Ok(ItemOutcome::Stale),
        };
    }

    match fetcher.fetch(&video.url, &dest).await {
        Ok(()) => {
            db.record_artifact(video.id, &dest.to_string_lossy())?;
            match db.advance(video.id, Stage::FetchPending, Stage::Fetched)? {
                AdvanceOutcome::Advanced => {
                    db.increment_channel_processed(video.channel_id)?;
                    tracing::info!("fetched audio for {} -> {}", video.video_id, dest.display());
                    Ok(ItemOutcome::Fetched)
                }
                AdvanceOutcome::Stale { .. } => Ok(ItemOutcome::Stale),
            }
        }
        Err(e) => {
            // Drop any partial file so the next attempt starts clean
            let _ = tokio::fs::remove_file(&dest).await;

            let outcome = db.mark_failed(
                video.id,
                Stage::FetchPending,
                &e.to_string(),
                e.is_retryable(),
                policy,
            )?;
            match &outcome {
                FailOutcome::Failed {
                    attempts,
                    next_retry_at,
                } => tracing::warn!(
                    "fetch failed for {} (attempt {}, retry at {:?}): {}",
                    video.video_id,
                    attempts,
                    next_retry_at,
                    e
                ),
                FailOutcome::Abandoned { attempts } => tracing::error!(
                    "abandoning {} after {} attempts: {}",
                    video.video_id,
                    attempts,
                    e
                ),
                FailOutcome::Stale { actual } => tracing::debug!(
                    "video {} moved to {} while its fetch was failing",
                    video.video_id,
                    actual
                ),
            }
            Ok(fold_fail(outcome))
        }
    }
}

fn fold_fail(outcome: FailOutcome) -> ItemOutcome {
    match outcome {
        FailOutcome::Failed { .. } => ItemOutcome::Failed,
        FailOutcome::Abandoned { .. } => ItemOutcome::Abandoned,
        FailOutcome::Stale { .. } => ItemOutcome::Stale,
    }
}

fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_keys() {
        assert!(is_safe_key("dQw4w9WgXcQ"));
        assert!(is_safe_key("abc_DEF-123"));
        assert!(!is_safe_key(""));
        assert!(!is_safe_key("../evil"));
        assert!(!is_safe_key("a/b"));
        assert!(!is_safe_key("a b"));
    }
}
