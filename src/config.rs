use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Runtime configuration, resolved from a YAML file plus environment
/// overrides. All paths are absolute by the time this struct exists.
#[derive(Debug, Clone)]
pub struct Config {
    pub channels: Vec<ChannelConfig>,
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub audio_dir: PathBuf,
    pub transcript_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub max_videos_per_poll: usize,
    pub channel_failure_threshold: i64,
    pub fetch: FetchConfig,
    pub watcher: WatcherConfig,
    pub retry: RetryConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_ytdlp_path")]
    pub ytdlp_path: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_transcript_suffix")]
    pub suffix: String,
    #[serde(default = "default_min_file_age_secs")]
    pub min_file_age_secs: u64,
    #[serde(default = "default_transcribe_engine")]
    pub engine: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_validation_retries")]
    pub validation_retries: u32,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    channels: Vec<ChannelConfig>,
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    database_path: Option<PathBuf>,
    #[serde(default)]
    audio_dir: Option<PathBuf>,
    #[serde(default)]
    transcript_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_max_videos_per_poll")]
    max_videos_per_poll: usize,
    #[serde(default = "default_channel_failure_threshold")]
    channel_failure_threshold: i64,
    #[serde(default)]
    fetch: FetchConfig,
    #[serde(default)]
    watcher: WatcherConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    llm: LlmConfig,
}

impl Config {
    /// Load from a YAML file. `OPENROUTER_API_KEY` in the environment wins
    /// over a key written in the file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let mut raw: RawConfig = serde_yaml::from_str(&text).map_err(|e| {
            PipelineError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;

        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.is_empty() {
                raw.llm.api_key = Some(key);
            }
        }

        Self::from_raw(raw)
    }

    /// Parse from a YAML string without touching the environment.
    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        let raw: RawConfig =
            serde_yaml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, PipelineError> {
        let data_dir = expand_tilde(&raw.data_dir.unwrap_or_else(default_data_dir));
        let database_path = raw
            .database_path
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| data_dir.join("tubescribe.db"));
        let audio_dir = raw
            .audio_dir
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| data_dir.join("audio"));
        let transcript_dir = raw
            .transcript_dir
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|| data_dir.join("transcripts"));

        let config = Config {
            channels: raw.channels,
            data_dir,
            database_path,
            audio_dir,
            transcript_dir,
            poll_interval_secs: raw.poll_interval_secs,
            max_videos_per_poll: raw.max_videos_per_poll,
            channel_failure_threshold: raw.channel_failure_threshold,
            fetch: raw.fetch,
            watcher: raw.watcher,
            retry: raw.retry,
            llm: raw.llm,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if self.channels.is_empty() {
            return Err(PipelineError::Config("no channels configured".to_string()));
        }
        for channel in &self.channels {
            if channel.id.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "channel '{}' has an empty id",
                    channel.name
                )));
            }
        }
        if self.fetch.max_concurrent == 0 {
            return Err(PipelineError::Config(
                "fetch.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts < 1 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_secs == 0 || self.retry.base_delay_secs > self.retry.max_delay_secs
        {
            return Err(PipelineError::Config(
                "retry delays must satisfy 0 < base_delay_secs <= max_delay_secs".to_string(),
            ));
        }
        if self.llm.enabled && self.llm.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(PipelineError::Config(
                "llm.api_key is not set; provide it in the config, set OPENROUTER_API_KEY, \
                 or disable enrichment with llm.enabled: false"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: default_ytdlp_path(),
            timeout_secs: default_fetch_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            audio_format: default_audio_format(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            suffix: default_transcript_suffix(),
            min_file_age_secs: default_min_file_age_secs(),
            engine: default_transcribe_engine(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_llm_model(),
            embedding_model: None,
            timeout_secs: default_llm_timeout_secs(),
            validation_retries: default_validation_retries(),
            max_prompt_chars: default_max_prompt_chars(),
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tubescribe")
}

fn default_poll_interval_secs() -> u64 {
    7200
}

fn default_max_videos_per_poll() -> usize {
    10
}

fn default_channel_failure_threshold() -> i64 {
    3
}

fn default_ytdlp_path() -> String {
    "yt-dlp".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    900
}

fn default_max_concurrent() -> usize {
    2
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_transcript_suffix() -> String {
    ".txt".to_string()
}

fn default_min_file_age_secs() -> u64 {
    5
}

fn default_transcribe_engine() -> String {
    "whisper".to_string()
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    3600
}

fn default_max_attempts() -> i64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_validation_retries() -> u32 {
    1
}

fn default_max_prompt_chars() -> usize {
    8000
}
