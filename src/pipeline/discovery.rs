//! Discovery pass: poll channel feeds and register new items.

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::database::{Database, NewVideo, RegisterOutcome};
use crate::error::PipelineError;
use crate::feeds::SourceLister;

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub channels_polled: usize,
    pub channels_failed: usize,
    pub found: usize,
    pub registered: usize,
}

/// One channel failing never blocks the others; its failure streak is
/// tracked on the channel row instead.
pub async fn run(
    db: &Database,
    cfg: &Config,
    lister: &dyn SourceLister,
    cancel: &CancellationToken,
) -> anyhow::Result<DiscoveryReport> {
    let mut report = DiscoveryReport::default();

    for channel in db.get_active_channels()? {
        if cancel.is_cancelled() {
            break;
        }

        let mut remote = match lister.list(&channel.channel_id).await {
            Ok(videos) => videos,
            Err(e) => {
                report.channels_failed += 1;
                let permanent = matches!(e, PipelineError::Permanent(_));
                let status = db.record_channel_failure(
                    channel.id,
                    permanent,
                    cfg.channel_failure_threshold,
                )?;
                tracing::warn!(
                    "polling channel {} failed (now {}): {}",
                    channel.channel_id,
                    status,
                    e
                );
                continue;
            }
        };

        report.channels_polled += 1;
        report.found += remote.len();

        // Newest first, so the per-poll cap favors fresh uploads
        remote.sort_by(|a, b| b.published_at.cmp(&a.published_at));

        let mut created = 0usize;
        for video in remote {
            let new_video = NewVideo {
                video_id: video.video_id,
                channel_id: channel.id,
                title: video.title,
                description: video.description,
                url: video.url,
                thumbnail_url: video.thumbnail_url,
                duration_secs: video.duration_secs,
                view_count: video.view_count,
                published_at: video.published_at,
            };
            match db.register_video(&new_video)? {
                RegisterOutcome::Created(_) => {
                    tracing::info!(
                        "discovered {} ({}) on {}",
                        new_video.title,
                        new_video.video_id,
                        channel.name
                    );
                    created += 1;
                    if created >= cfg.max_videos_per_poll {
                        tracing::debug!(
                            "per-poll cap of {} reached for {}",
                            cfg.max_videos_per_poll,
                            channel.channel_id
                        );
                        break;
                    }
                }
                RegisterOutcome::AlreadyExists(_) => {}
            }
        }

        report.registered += created;
        db.touch_channel_checked(channel.id, created as i64)?;
    }

    Ok(report)
}
