//! Enrichment pass: turn stored transcripts into structured notes.
//!
//! A rate-limit answer from the provider aborts the whole pass and leaves
//! the remaining items untouched at `transcribed`; they are picked up fresh
//! on the next cycle. Schema rejections get a bounded in-pass rerun before
//! the item is parked for manual attention.

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::{Database, FailOutcome, Stage, StoreOutcome};
use crate::error::PipelineError;
use crate::llm::Summarizer;
use crate::pipeline::policy::RetryPolicy;

#[derive(Debug, Default)]
pub struct EnrichReport {
    pub attempted: usize,
    pub enriched: usize,
    pub failed: usize,
    pub embedded: usize,
    pub rate_limited: bool,
}

pub async fn run(
    db: &Database,
    cfg: &Config,
    summarizer: &dyn Summarizer,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> anyhow::Result<EnrichReport> {
    let mut report = EnrichReport::default();

    for video in db.videos_in_stage(Stage::Transcribed)? {
        if cancel.is_cancelled() {
            break;
        }
        report.attempted += 1;

        let transcript = match db.get_transcript_for_video(video.id)? {
            Some(t) => t,
            None => {
                tracing::warn!(
                    "{} is at transcribed but has no transcript row, skipping",
                    video.video_id
                );
                continue;
            }
        };

        let mut result = None;
        for attempt in 0..=cfg.llm.validation_retries {
            if cancel.is_cancelled() {
                break;
            }
            match summarizer.enrich(&transcript.body).await {
                Ok(r) => {
                    result = Some(r);
                    break;
                }
                Err(PipelineError::RateLimited(msg)) => {
                    tracing::warn!("provider rate limit hit, ending enrichment pass: {}", msg);
                    report.rate_limited = true;
                    return Ok(report);
                }
                Err(e @ PipelineError::Validation(_)) if attempt < cfg.llm.validation_retries => {
                    tracing::warn!(
                        "model response rejected for {} (attempt {}): {}",
                        video.video_id,
                        attempt + 1,
                        e
                    );
                }
                Err(e) => {
                    let outcome = db.mark_failed(
                        video.id,
                        Stage::Transcribed,
                        &e.to_string(),
                        e.is_retryable(),
                        policy,
                    )?;
                    match outcome {
                        FailOutcome::Abandoned { attempts } => tracing::error!(
                            "abandoning {} after {} attempts: {}",
                            video.video_id,
                            attempts,
                            e
                        ),
                        _ => tracing::warn!("enrichment failed for {}: {}", video.video_id, e),
                    }
                    report.failed += 1;
                    break;
                }
            }
        }
        let result = match result {
            Some(r) => r,
            None => continue,
        };

        let chapters_json = serde_json::to_string(&result.payload.chapters)?;
        let key_points_json = serde_json::to_string(&result.payload.key_points)?;

        match db.store_enrichment_and_advance(
            video.id,
            transcript.id,
            &result.payload.summary,
            &chapters_json,
            &key_points_json,
            &result.model,
            result.tokens_used,
            Some(result.latency_ms),
        )? {
            StoreOutcome::Stored { .. } => {
                tracing::info!(
                    "enriched {} ({} chapters, {} key points)",
                    video.video_id,
                    result.payload.chapters.len(),
                    result.payload.key_points.len()
                );
                report.enriched += 1;
            }
            StoreOutcome::Skipped { stage } => {
                tracing::debug!(
                    "{} moved to {} before its enrichment stored",
                    video.video_id,
                    stage
                );
                continue;
            }
        }

        // Embeddings ride along after the item is terminal; a failure here
        // never unwinds the enrichment
        match summarizer.embed(&transcript.body).await {
            Ok(Some(vector)) => {
                if db.set_transcript_embedding(transcript.id, &vector)? {
                    report.embedded += 1;
                }
            }
            Ok(None) => {}
            Err(PipelineError::RateLimited(msg)) => {
                tracing::warn!(
                    "provider rate limit hit during embedding, ending pass: {}",
                    msg
                );
                report.rate_limited = true;
                return Ok(report);
            }
            Err(e) => {
                tracing::warn!("embedding failed for {}: {}", video.video_id, e);
            }
        }
    }

    Ok(report)
}
