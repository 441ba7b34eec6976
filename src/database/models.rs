use serde::{Deserialize, Serialize};

/// Position of an item in the pipeline lifecycle.
///
/// The main chain advances one step at a time; `Failed` is reachable from any
/// non-terminal stage and records the stage it fell from in
/// `Video::failed_from`. `Enriched` and `Abandoned` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    FetchPending,
    Fetched,
    Transcribed,
    Enriched,
    Failed,
    Abandoned,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::FetchPending => "fetch_pending",
            Self::Fetched => "fetched",
            Self::Transcribed => "transcribed",
            Self::Enriched => "enriched",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    /// Index on the forward chain; None for `Failed`/`Abandoned`.
    pub fn chain_index(&self) -> Option<u8> {
        match self {
            Self::Discovered => Some(0),
            Self::FetchPending => Some(1),
            Self::Fetched => Some(2),
            Self::Transcribed => Some(3),
            Self::Enriched => Some(4),
            Self::Failed | Self::Abandoned => None,
        }
    }

    /// Legal single-step forward transition on the main chain.
    pub fn can_advance_to(&self, to: Stage) -> bool {
        match (self.chain_index(), to.chain_index()) {
            (Some(a), Some(b)) => b == a + 1,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Enriched | Self::Abandoned)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for Stage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "discovered" => Self::Discovered,
            "fetch_pending" => Self::FetchPending,
            "fetched" => Self::Fetched,
            "transcribed" => Self::Transcribed,
            "enriched" => Self::Enriched,
            "abandoned" => Self::Abandoned,
            // Unknown values land in failed so they never reprocess silently
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Active,
    Paused,
    Error,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for ChannelStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "paused" => Self::Paused,
            "error" => Self::Error,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_id: String,
    pub name: String,
    pub status: ChannelStatus,
    pub consecutive_failures: i64,
    pub last_checked: Option<String>,
    pub videos_found: i64,
    pub videos_processed: i64,
    pub added_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Video {
    pub id: i64,
    pub video_id: String,
    pub channel_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<i64>,
    pub view_count: Option<i64>,
    pub published_at: Option<String>,
    pub stage: Stage,
    pub failed_from: Option<Stage>,
    pub last_error: Option<String>,
    pub attempts: i64,
    pub next_retry_at: Option<String>,
    pub audio_path: Option<String>,
    pub has_transcript: bool,
    pub has_enrichment: bool,
    pub discovered_at: String,
    pub fetched_at: Option<String>,
    pub transcribed_at: Option<String>,
    pub enriched_at: Option<String>,
}

/// Fields supplied when a video is first observed on a channel listing.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub video_id: String,
    pub channel_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<i64>,
    pub view_count: Option<i64>,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: i64,
    pub video_id: i64,
    pub body: String,
    pub word_count: i64,
    pub engine: String,
    pub version: i64,
    pub language: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrichment {
    pub id: i64,
    pub transcript_id: i64,
    pub summary: String,
    pub chapters_json: String,
    pub key_points_json: String,
    pub model: String,
    pub tokens_used: Option<i64>,
    pub latency_ms: Option<i64>,
    pub created_at: String,
}

/// One nearest-neighbor match from semantic search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub video_id: String,
    pub title: String,
    pub score: f32,
}

// ============================================================================
// Operation outcomes
// ============================================================================

/// Outcome of registering a video by its natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created(i64),
    AlreadyExists(i64),
}

impl RegisterOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn video_id(&self) -> i64 {
        match self {
            Self::Created(id) | Self::AlreadyExists(id) => *id,
        }
    }
}

/// Outcome of a compare-and-swap stage transition. `Stale` means another
/// pass already moved the item; the caller skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Advanced,
    Stale { actual: Stage },
}

/// Outcome of a combined store-and-advance transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { id: i64 },
    Skipped { stage: Stage },
}

/// Outcome of recording a failure against an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Recorded; `next_retry_at` is None for non-retryable failures.
    Failed {
        attempts: i64,
        next_retry_at: Option<String>,
    },
    /// Attempt ceiling reached; the item is terminal until a manual reset.
    Abandoned { attempts: i64 },
    /// The item was no longer at the expected stage.
    Stale { actual: Stage },
}
