// End-to-end pipeline cycles against scripted collaborators.
// Run with: cargo test --package tubescribe --test pipeline

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tubescribe::config::{
    ChannelConfig, Config, FetchConfig, LlmConfig, RetryConfig, WatcherConfig,
};
use tubescribe::database::{Database, NewVideo, Stage};
use tubescribe::error::PipelineError;
use tubescribe::feeds::{RemoteVideo, SourceLister};
use tubescribe::fetcher::AudioFetcher;
use tubescribe::llm::{Chapter, EnrichmentPayload, EnrichmentResult, Summarizer};
use tubescribe::pipeline::Pipeline;

// =========================================================================
// Fixtures
// =========================================================================

fn test_config(root: &Path) -> Config {
    Config {
        channels: vec![ChannelConfig {
            id: "UCtest".to_string(),
            name: "Test Channel".to_string(),
        }],
        data_dir: root.to_path_buf(),
        database_path: root.join("test.db"),
        audio_dir: root.join("audio"),
        transcript_dir: root.join("transcripts"),
        poll_interval_secs: 3600,
        max_videos_per_poll: 10,
        channel_failure_threshold: 3,
        fetch: FetchConfig {
            ytdlp_path: "yt-dlp".to_string(),
            timeout_secs: 30,
            max_concurrent: 2,
            audio_format: "mp3".to_string(),
        },
        watcher: WatcherConfig {
            suffix: ".txt".to_string(),
            min_file_age_secs: 0,
            engine: "whisper".to_string(),
        },
        retry: RetryConfig {
            base_delay_secs: 30,
            max_delay_secs: 3600,
            max_attempts: 5,
        },
        llm: LlmConfig {
            enabled: true,
            base_url: "http://unused.local".to_string(),
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            embedding_model: None,
            timeout_secs: 5,
            validation_retries: 1,
            max_prompt_chars: 8000,
        },
    }
}

fn setup() -> (TempDir, Config, Arc<Database>) {
    let temp = TempDir::new().unwrap();
    let cfg = test_config(temp.path());
    std::fs::create_dir_all(&cfg.audio_dir).unwrap();
    std::fs::create_dir_all(&cfg.transcript_dir).unwrap();
    let db = Arc::new(Database::new(&cfg.database_path).unwrap());
    for channel in &cfg.channels {
        db.sync_channel(&channel.id, &channel.name).unwrap();
    }
    (temp, cfg, db)
}

fn remote(key: &str) -> RemoteVideo {
    RemoteVideo {
        video_id: key.to_string(),
        title: format!("Video {}", key),
        description: Some("a description".to_string()),
        url: format!("https://example.com/watch/{}", key),
        thumbnail_url: None,
        duration_secs: Some(300),
        view_count: Some(10),
        published_at: Some("2026-01-01T00:00:00+00:00".to_string()),
    }
}

fn seed_fetched(db: &Database, key: &str) -> i64 {
    let (ch, _) = db.sync_channel("UCtest", "Test Channel").unwrap();
    let id = db
        .register_video(&NewVideo {
            video_id: key.to_string(),
            channel_id: ch,
            title: format!("Video {}", key),
            description: None,
            url: format!("https://example.com/watch/{}", key),
            thumbnail_url: None,
            duration_secs: None,
            view_count: None,
            published_at: None,
        })
        .unwrap()
        .video_id();
    db.advance(id, Stage::Discovered, Stage::FetchPending).unwrap();
    db.advance(id, Stage::FetchPending, Stage::Fetched).unwrap();
    id
}

fn seed_transcribed(db: &Database, key: &str) -> i64 {
    let id = seed_fetched(db, key);
    db.store_transcript_and_advance(id, "words were said", "whisper", None)
        .unwrap();
    id
}

// =========================================================================
// Scripted collaborators
// =========================================================================

struct StaticLister {
    videos: Vec<RemoteVideo>,
}

#[async_trait]
impl SourceLister for StaticLister {
    async fn list(&self, _channel_id: &str) -> Result<Vec<RemoteVideo>, PipelineError> {
        Ok(self.videos.clone())
    }
}

struct FakeFetcher {
    calls: AtomicUsize,
}

impl FakeFetcher {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AudioFetcher for FakeFetcher {
    async fn fetch(&self, _url: &str, dest: &Path) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, b"audio bytes").await?;
        Ok(())
    }
}

struct FailingFetcher;

#[async_trait]
impl AudioFetcher for FailingFetcher {
    async fn fetch(&self, _url: &str, _dest: &Path) -> Result<(), PipelineError> {
        Err(PipelineError::Transient("network down".to_string()))
    }
}

struct ScriptedSummarizer {
    calls: AtomicUsize,
}

impl ScriptedSummarizer {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn enrich(&self, transcript: &str) -> Result<EnrichmentResult, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EnrichmentResult {
            payload: EnrichmentPayload {
                summary: format!("summary of {} chars", transcript.len()),
                chapters: vec![Chapter {
                    title: "Start".to_string(),
                    timestamp: Some("00:00:00".to_string()),
                }],
                key_points: vec!["a point".to_string()],
            },
            model: "test-model".to_string(),
            tokens_used: Some(42),
            latency_ms: 5,
        })
    }

    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, PipelineError> {
        Ok(Some(vec![1.0, 0.0, 0.0]))
    }
}

/// Always rejects with a schema error, as a model that refuses the JSON
/// contract would.
struct RejectingSummarizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for RejectingSummarizer {
    async fn enrich(&self, _transcript: &str) -> Result<EnrichmentResult, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Validation(
            "model response schema: missing field `chapters`".to_string(),
        ))
    }

    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, PipelineError> {
        Ok(None)
    }
}

struct RateLimitedSummarizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for RateLimitedSummarizer {
    async fn enrich(&self, _transcript: &str) -> Result<EnrichmentResult, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::RateLimited("HTTP 429".to_string()))
    }

    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, PipelineError> {
        Ok(None)
    }
}

// =========================================================================
// Full cycles
// =========================================================================

#[tokio::test]
async fn full_cycle_takes_an_item_from_feed_to_enriched() {
    let (_temp, cfg, db) = setup();
    let lister = Arc::new(StaticLister {
        videos: vec![remote("vid001")],
    });
    let fetcher = Arc::new(FakeFetcher::new());
    let summarizer = Arc::new(ScriptedSummarizer::new());

    let pipeline = Pipeline::with_collaborators(
        db.clone(),
        cfg.clone(),
        lister,
        fetcher.clone(),
        Some(summarizer.clone()),
    );
    let cancel = CancellationToken::new();

    // Cycle 1: discover and fetch; no transcript file exists yet
    let report = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(report.discovery.registered, 1);
    assert_eq!(report.fetch.fetched, 1);
    assert_eq!(report.watcher.stored, 0);

    let v = db.get_video_by_natural_key("vid001").unwrap().unwrap();
    assert_eq!(v.stage, Stage::Fetched);
    assert!(v.audio_path.is_some());
    assert!(cfg.audio_dir.join("vid001.mp3").exists());

    // A transcription tool deposits the matching file
    std::fs::write(cfg.transcript_dir.join("vid001.txt"), "words were said here").unwrap();

    // Cycle 2: the transcript lands and enrichment follows in the same cycle
    let report = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(report.watcher.stored, 1);
    assert_eq!(report.enrich.as_ref().unwrap().enriched, 1);

    let v = db.get_video_by_natural_key("vid001").unwrap().unwrap();
    assert_eq!(v.stage, Stage::Enriched);
    assert_eq!(db.store_totals().unwrap(), (1, 1));
    let t = db.get_transcript_for_video(v.id).unwrap().unwrap();
    assert!(t.embedding.is_some());

    // Cycle 3: everything is terminal, so nothing re-runs
    let fetch_calls = fetcher.calls.load(Ordering::SeqCst);
    let enrich_calls = summarizer.calls.load(Ordering::SeqCst);
    let report = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(report.discovery.registered, 0);
    assert_eq!(report.fetch.fetched, 0);
    assert_eq!(report.watcher.stored, 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), fetch_calls);
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), enrich_calls);
    assert_eq!(db.store_totals().unwrap(), (1, 1));
}

#[tokio::test]
async fn repeated_discovery_never_duplicates_items() {
    let (_temp, cfg, db) = setup();
    let lister = Arc::new(StaticLister {
        videos: vec![remote("a"), remote("b")],
    });
    let fetcher = Arc::new(FakeFetcher::new());

    let pipeline =
        Pipeline::with_collaborators(db.clone(), cfg.clone(), lister, fetcher.clone(), None);
    let cancel = CancellationToken::new();

    let first = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(first.discovery.registered, 2);

    let second = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(second.discovery.registered, 0);

    assert_eq!(db.videos_in_stage(Stage::Fetched).unwrap().len(), 2);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn existing_audio_file_skips_the_downloader() {
    let (_temp, cfg, db) = setup();
    std::fs::write(cfg.audio_dir.join("vid001.mp3"), b"already here").unwrap();

    let lister = Arc::new(StaticLister {
        videos: vec![remote("vid001")],
    });
    let fetcher = Arc::new(FakeFetcher::new());

    let pipeline =
        Pipeline::with_collaborators(db.clone(), cfg.clone(), lister, fetcher.clone(), None);
    let report = pipeline.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.fetch.skipped_existing, 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

    let v = db.get_video_by_natural_key("vid001").unwrap().unwrap();
    assert_eq!(v.stage, Stage::Fetched);
    assert!(v
        .audio_path
        .as_deref()
        .unwrap_or_default()
        .ends_with("vid001.mp3"));
}

#[tokio::test]
async fn unmatched_transcript_files_are_left_in_place() {
    let (_temp, cfg, db) = setup();
    std::fs::write(cfg.transcript_dir.join("mystery.txt"), "who is this").unwrap();

    let lister = Arc::new(StaticLister { videos: vec![] });
    let pipeline = Pipeline::with_collaborators(
        db.clone(),
        cfg.clone(),
        lister,
        Arc::new(FakeFetcher::new()),
        None,
    );
    let report = pipeline.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.watcher.unmatched, 1);
    assert_eq!(report.watcher.stored, 0);
    assert!(cfg.transcript_dir.join("mystery.txt").exists());
}

#[tokio::test]
async fn blank_transcript_files_wait_for_content() {
    let (_temp, cfg, db) = setup();
    seed_fetched(&db, "vid001");
    seed_fetched(&db, "vid002");
    std::fs::write(cfg.transcript_dir.join("vid001.txt"), "").unwrap();
    std::fs::write(cfg.transcript_dir.join("vid002.txt"), " \n\t\n").unwrap();

    let lister = Arc::new(StaticLister { videos: vec![] });
    let pipeline = Pipeline::with_collaborators(
        db.clone(),
        cfg.clone(),
        lister,
        Arc::new(FakeFetcher::new()),
        None,
    );
    let cancel = CancellationToken::new();

    // Zero-length and whitespace-only files both sit out the pass
    let report = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(report.watcher.deferred, 2);
    assert_eq!(report.watcher.stored, 0);
    for key in ["vid001", "vid002"] {
        let v = db.get_video_by_natural_key(key).unwrap().unwrap();
        assert_eq!(v.stage, Stage::Fetched);
    }

    // Once the tool writes real content the file lands normally
    std::fs::write(cfg.transcript_dir.join("vid001.txt"), "now with words").unwrap();
    let report = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(report.watcher.stored, 1);
    assert_eq!(report.watcher.deferred, 1);
    let v = db.get_video_by_natural_key("vid001").unwrap().unwrap();
    assert_eq!(v.stage, Stage::Transcribed);
}

#[tokio::test]
async fn failed_fetch_backs_off_without_blocking_the_run() {
    let (_temp, cfg, db) = setup();
    let lister = Arc::new(StaticLister {
        videos: vec![remote("vid001")],
    });

    let pipeline = Pipeline::with_collaborators(
        db.clone(),
        cfg.clone(),
        lister,
        Arc::new(FailingFetcher),
        None,
    );
    let cancel = CancellationToken::new();

    let report = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(report.fetch.failed, 1);

    let v = db.get_video_by_natural_key("vid001").unwrap().unwrap();
    assert_eq!(v.stage, Stage::Failed);
    assert_eq!(v.failed_from, Some(Stage::FetchPending));
    assert_eq!(v.attempts, 1);
    assert!(v.next_retry_at.is_some());

    // Rerunning immediately promotes nothing; the item waits out its backoff
    let report = pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(report.retries_promoted, 0);
    assert_eq!(report.fetch.attempted, 0);
    assert_eq!(
        db.get_video_by_natural_key("vid001").unwrap().unwrap().attempts,
        1
    );
}

#[tokio::test]
async fn rejected_model_output_gets_one_rerun_then_parks_the_item() {
    let (_temp, cfg, db) = setup();
    let lister = Arc::new(StaticLister { videos: vec![] });
    let summarizer = Arc::new(RejectingSummarizer {
        calls: AtomicUsize::new(0),
    });
    seed_transcribed(&db, "vid001");

    let pipeline = Pipeline::with_collaborators(
        db.clone(),
        cfg.clone(),
        lister,
        Arc::new(FakeFetcher::new()),
        Some(summarizer.clone()),
    );
    let cancel = CancellationToken::new();

    pipeline.run_once(&cancel).await.unwrap();

    // Initial call plus exactly one in-pass rerun
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);

    let v = db.get_video_by_natural_key("vid001").unwrap().unwrap();
    assert_eq!(v.stage, Stage::Failed);
    assert_eq!(v.failed_from, Some(Stage::Transcribed));
    assert!(v.next_retry_at.is_none());

    // Parked items sit out later cycles
    pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);

    // A manual reset makes the item eligible again
    assert_eq!(db.reset_video("vid001", false).unwrap(), Some(Stage::Transcribed));
    pipeline.run_once(&cancel).await.unwrap();
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn rate_limit_ends_the_enrichment_pass_without_failing_items() {
    let (_temp, cfg, db) = setup();
    let lister = Arc::new(StaticLister { videos: vec![] });
    let summarizer = Arc::new(RateLimitedSummarizer {
        calls: AtomicUsize::new(0),
    });
    seed_transcribed(&db, "vid001");
    seed_transcribed(&db, "vid002");

    let pipeline = Pipeline::with_collaborators(
        db.clone(),
        cfg.clone(),
        lister,
        Arc::new(FakeFetcher::new()),
        Some(summarizer.clone()),
    );
    let report = pipeline.run_once(&CancellationToken::new()).await.unwrap();

    let enrich = report.enrich.unwrap();
    assert!(enrich.rate_limited);
    assert_eq!(enrich.failed, 0);
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);

    // Both items are untouched and will be retried next cycle
    for key in ["vid001", "vid002"] {
        let v = db.get_video_by_natural_key(key).unwrap().unwrap();
        assert_eq!(v.stage, Stage::Transcribed);
        assert_eq!(v.attempts, 0);
    }
}

#[tokio::test]
async fn disabled_enrichment_leaves_items_at_transcribed() {
    let (_temp, cfg, db) = setup();
    let lister = Arc::new(StaticLister {
        videos: vec![remote("vid001")],
    });

    let pipeline = Pipeline::with_collaborators(
        db.clone(),
        cfg.clone(),
        lister,
        Arc::new(FakeFetcher::new()),
        None,
    );
    let cancel = CancellationToken::new();

    pipeline.run_once(&cancel).await.unwrap();
    std::fs::write(cfg.transcript_dir.join("vid001.txt"), "some words").unwrap();
    let report = pipeline.run_once(&cancel).await.unwrap();

    assert!(report.enrich.is_none());
    let v = db.get_video_by_natural_key("vid001").unwrap().unwrap();
    assert_eq!(v.stage, Stage::Transcribed);
}

#[tokio::test]
async fn cancelled_run_stops_before_doing_work() {
    let (_temp, cfg, db) = setup();
    let lister = Arc::new(StaticLister {
        videos: vec![remote("vid001")],
    });
    let fetcher = Arc::new(FakeFetcher::new());

    let pipeline =
        Pipeline::with_collaborators(db.clone(), cfg.clone(), lister, fetcher.clone(), None);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = pipeline.run_once(&cancel).await.unwrap();

    assert_eq!(report.discovery.channels_polled, 0);
    assert_eq!(report.fetch.attempted, 0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
}
