//! Channel feed polling.
//!
//! YouTube publishes a per-channel Atom feed of the most recent uploads.
//! Entries carry a Media RSS group with description, thumbnail, and view
//! statistics alongside the Atom basics.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{classify_status, PipelineError};

const FEED_URL_BASE: &str = "https://www.youtube.com/feeds/videos.xml?channel_id=";
const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// One entry from a channel feed, before registration.
#[derive(Debug, Clone)]
pub struct RemoteVideo {
    pub video_id: String,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<i64>,
    pub view_count: Option<i64>,
    pub published_at: Option<String>,
}

/// Lists what a remote channel currently offers. The pipeline only sees this
/// trait, so tests substitute a scripted source.
#[async_trait]
pub trait SourceLister: Send + Sync {
    async fn list(&self, channel_id: &str) -> Result<Vec<RemoteVideo>, PipelineError>;
}

pub struct RssLister {
    client: reqwest::Client,
}

impl RssLister {
    pub fn new() -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(FEED_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceLister for RssLister {
    async fn list(&self, channel_id: &str) -> Result<Vec<RemoteVideo>, PipelineError> {
        let url = format!("{}{}", FEED_URL_BASE, channel_id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &format!("feed for {}", channel_id)));
        }

        let body = response.text().await?;
        let feed = feed_rs::parser::parse(body.as_bytes())
            .map_err(|e| PipelineError::Validation(format!("feed for {}: {}", channel_id, e)))?;

        Ok(feed.entries.into_iter().filter_map(map_entry).collect())
    }
}

fn map_entry(entry: feed_rs::model::Entry) -> Option<RemoteVideo> {
    // YouTube entry ids look like "yt:video:dQw4w9WgXcQ"
    let video_id = match entry.id.strip_prefix("yt:video:") {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            tracing::debug!("skipping feed entry with unexpected id {:?}", entry.id);
            return None;
        }
    };

    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_else(|| "(untitled)".to_string());
    let url = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", video_id));

    let media = entry.media.first();
    let description = media
        .and_then(|m| m.description.as_ref())
        .map(|d| d.content.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()));
    let thumbnail_url = media
        .and_then(|m| m.thumbnails.first())
        .map(|t| t.image.uri.clone());
    let duration_secs = media
        .and_then(|m| m.duration.or_else(|| m.content.first().and_then(|c| c.duration)))
        .map(|d| d.as_secs() as i64);
    let view_count = media
        .and_then(|m| m.community.as_ref())
        .and_then(|c| c.stats_views)
        .map(|v| v as i64);
    let published_at = entry.published.map(|d| d.to_rfc3339());

    Some(RemoteVideo {
        video_id,
        title,
        description,
        url,
        thumbnail_url,
        duration_secs,
        view_count,
        published_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015"
      xmlns:media="http://search.yahoo.com/mrss/"
      xmlns="http://www.w3.org/2005/Atom">
  <id>yt:channel:UCtest</id>
  <title>Test Channel</title>
  <entry>
    <id>yt:video:dQw4w9WgXcQ</id>
    <title>First Upload</title>
    <link rel="alternate" href="https://www.youtube.com/watch?v=dQw4w9WgXcQ"/>
    <published>2026-01-05T10:00:00+00:00</published>
    <media:group>
      <media:title>First Upload</media:title>
      <media:thumbnail url="https://i.ytimg.com/vi/dQw4w9WgXcQ/hqdefault.jpg" width="480" height="360"/>
      <media:description>A description.</media:description>
      <media:community>
        <media:statistics views="12345"/>
      </media:community>
    </media:group>
  </entry>
  <entry>
    <id>not-a-video-id</id>
    <title>Broken Entry</title>
  </entry>
</feed>"#;

    #[test]
    fn maps_youtube_entries_and_skips_malformed_ids() {
        let feed = feed_rs::parser::parse(FIXTURE.as_bytes()).unwrap();
        let videos: Vec<RemoteVideo> = feed.entries.into_iter().filter_map(map_entry).collect();

        assert_eq!(videos.len(), 1);
        let v = &videos[0];
        assert_eq!(v.video_id, "dQw4w9WgXcQ");
        assert_eq!(v.title, "First Upload");
        assert_eq!(v.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(v.description.as_deref(), Some("A description."));
        assert!(v
            .thumbnail_url
            .as_deref()
            .unwrap_or_default()
            .contains("hqdefault.jpg"));
        assert_eq!(v.view_count, Some(12345));
        assert!(v.published_at.as_deref().unwrap_or_default().starts_with("2026-01-05"));
    }
}
