//! Watched-folder pass: reconcile deposited transcript files.
//!
//! An external transcription tool (or a human) drops `<video_id>.txt` files
//! into the transcript directory. Each pass lists the whole directory and
//! matches files against the registry by stem. Listing beats file-event
//! subscriptions here: a missed pass costs nothing but time, and files that
//! arrived while the pipeline was down are picked up the same way as fresh
//! ones. Files are never deleted or moved.

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::{Database, Stage, StoreOutcome};

#[derive(Debug, Default)]
pub struct WatcherReport {
    pub files_seen: usize,
    pub stored: usize,
    pub skipped_done: usize,
    pub unmatched: usize,
    pub deferred: usize,
}

pub async fn run(
    db: &Database,
    cfg: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<WatcherReport> {
    let mut report = WatcherReport::default();
    let dir = &cfg.transcript_dir;

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("cannot list transcript dir {}: {}", dir.display(), e);
            return Ok(report);
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        if cancel.is_cancelled() {
            break;
        }

        let path = entry.path();
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();

        if !file_name.ends_with(cfg.watcher.suffix.as_str()) {
            continue;
        }
        report.files_seen += 1;

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("cannot stat {}: {}", path.display(), e);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        // Stability window: a file still being written gets picked up on a
        // later pass instead
        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age.as_secs() < cfg.watcher.min_file_age_secs {
            tracing::debug!("{} was modified {}s ago, waiting", file_name, age.as_secs());
            report.deferred += 1;
            continue;
        }
        if metadata.len() == 0 {
            tracing::warn!("{} is empty, waiting for the tool to write it", file_name);
            report.deferred += 1;
            continue;
        }

        let stem = match file_name.strip_suffix(cfg.watcher.suffix.as_str()) {
            Some(s) if !s.is_empty() => s,
            _ => {
                report.unmatched += 1;
                continue;
            }
        };

        let video = match db.get_video_by_natural_key(stem)? {
            Some(v) => v,
            None => {
                tracing::warn!(
                    "transcript file {} matches no tracked item, leaving it in place",
                    file_name
                );
                report.unmatched += 1;
                continue;
            }
        };

        match video.stage {
            Stage::Fetched => {}
            Stage::Transcribed | Stage::Enriched => {
                tracing::debug!("{} already transcribed, ignoring {}", video.video_id, file_name);
                report.skipped_done += 1;
                continue;
            }
            other => {
                tracing::warn!(
                    "transcript file {} arrived while {} is at {}, leaving it in place",
                    file_name,
                    video.video_id,
                    other
                );
                report.unmatched += 1;
                continue;
            }
        }

        let body = match tokio::fs::read_to_string(&path).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("cannot read {}: {}", path.display(), e);
                continue;
            }
        };
        if body.trim().is_empty() {
            tracing::warn!("{} has only whitespace, waiting for real content", file_name);
            report.deferred += 1;
            continue;
        }

        match db.store_transcript_and_advance(video.id, &body, &cfg.watcher.engine, None)? {
            StoreOutcome::Stored { id } => {
                tracing::info!("stored transcript {} for {}", id, video.video_id);
                report.stored += 1;
            }
            StoreOutcome::Skipped { stage } => {
                tracing::debug!(
                    "{} moved to {} before its transcript stored",
                    video.video_id,
                    stage
                );
                report.skipped_done += 1;
            }
        }
    }

    Ok(report)
}
