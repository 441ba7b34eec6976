//! Audio acquisition via yt-dlp.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::FetchConfig;
use crate::error::PipelineError;

/// Error markers yt-dlp prints for videos that will never download.
const PERMANENT_MARKERS: &[&str] = &[
    "Video unavailable",
    "Private video",
    "This video has been removed",
    "account associated with this video has been terminated",
];

/// Downloads the audio for one item to a caller-chosen path. The pipeline
/// only sees this trait, so tests substitute a fake that writes a file.
#[async_trait]
pub trait AudioFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), PipelineError>;
}

pub struct YtDlpFetcher {
    binary: String,
    timeout: Duration,
    audio_format: String,
}

impl YtDlpFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            binary: config.ytdlp_path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            audio_format: config.audio_format.clone(),
        }
    }
}

#[async_trait]
impl AudioFetcher for YtDlpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<(), PipelineError> {
        tracing::debug!("running {} for {}", self.binary, url);

        let child = Command::new(&self.binary)
            .arg("-f")
            .arg("bestaudio")
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg(&self.audio_format)
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg("-o")
            .arg(dest)
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Transient(format!("spawn {}: {}", self.binary, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                PipelineError::Transient(format!("wait for {}: {}", self.binary, e))
            })?,
            Err(_) => {
                // Dropping the timed-out future kills the child via kill_on_drop
                return Err(PipelineError::Transient(format!(
                    "{} timed out after {}s",
                    self.binary,
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_fetch_error(&stderr));
        }

        if !dest.exists() {
            return Err(PipelineError::Transient(format!(
                "{} exited cleanly but {} is missing",
                self.binary,
                dest.display()
            )));
        }

        Ok(())
    }
}

fn classify_fetch_error(stderr: &str) -> PipelineError {
    let tail = tail_of(stderr, 400);
    if PERMANENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        PipelineError::Permanent(format!("yt-dlp: {}", tail))
    } else {
        PipelineError::Transient(format!("yt-dlp: {}", tail))
    }
}

/// Last `max_chars` of the text; yt-dlp puts the actual error at the end.
fn tail_of(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}
