pub mod models;


use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

use crate::pipeline::policy::RetryPolicy;

const VIDEO_COLUMNS: &str = "id, video_id, channel_id, title, description, url, thumbnail_url,
             duration_secs, view_count, published_at, stage, failed_from, last_error,
             attempts, next_retry_at, audio_path, has_transcript, has_enrichment,
             discovered_at, fetched_at, transcribed_at, enriched_at";

const CHANNEL_COLUMNS: &str = "id, channel_id, name, status, consecutive_failures,
             last_checked, videos_found, videos_processed, added_date";

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Monitored channels
            CREATE TABLE IF NOT EXISTS channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_checked TEXT,
                videos_found INTEGER NOT NULL DEFAULT 0,
                videos_processed INTEGER NOT NULL DEFAULT 0,
                added_date TEXT NOT NULL DEFAULT (datetime('now'))
            );

            -- Tracked items, keyed by the source's natural video id
            CREATE TABLE IF NOT EXISTS videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id TEXT NOT NULL UNIQUE,
                channel_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                url TEXT NOT NULL,
                thumbnail_url TEXT,
                duration_secs INTEGER,
                view_count INTEGER,
                published_at TEXT,
                stage TEXT NOT NULL DEFAULT 'discovered',
                failed_from TEXT,
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_retry_at TEXT,
                audio_path TEXT,
                has_transcript INTEGER NOT NULL DEFAULT 0,
                has_enrichment INTEGER NOT NULL DEFAULT 0,
                discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
                fetched_at TEXT,
                transcribed_at TEXT,
                enriched_at TEXT,
                FOREIGN KEY (channel_id) REFERENCES channels(id)
            );

            CREATE INDEX IF NOT EXISTS idx_videos_stage ON videos(stage, next_retry_at);
            CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
            CREATE INDEX IF NOT EXISTS idx_videos_published ON videos(published_at DESC);

            -- Immutable transcript versions per item and engine
            CREATE TABLE IF NOT EXISTS transcripts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                video_id INTEGER NOT NULL,
                body TEXT NOT NULL,
                word_count INTEGER NOT NULL,
                engine TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                language TEXT,
                embedding BLOB,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
                UNIQUE(video_id, engine, version)
            );

            CREATE INDEX IF NOT EXISTS idx_transcripts_video ON transcripts(video_id);

            -- AI-derived structured notes, one per transcript
            CREATE TABLE IF NOT EXISTS enrichments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transcript_id INTEGER NOT NULL UNIQUE,
                summary TEXT NOT NULL,
                chapters_json TEXT NOT NULL,
                key_points_json TEXT NOT NULL,
                model TEXT NOT NULL,
                tokens_used INTEGER,
                latency_ms INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (transcript_id) REFERENCES transcripts(id) ON DELETE CASCADE
            );

            -- Operational key-value store
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT DEFAULT (datetime('now'))
            );
        "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Insert a channel from configuration or refresh its display name.
    /// Existing rows keep their stored status so a paused channel stays paused.
    pub fn sync_channel(&self, channel_id: &str, name: &str) -> Result<(i64, bool)> {
        let conn = self.conn.lock().unwrap();

        let existing_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM channels WHERE channel_id = ?",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing_id {
            conn.execute(
                "UPDATE channels SET name = ? WHERE id = ?",
                params![name, id],
            )?;
            Ok((id, false))
        } else {
            conn.execute(
                "INSERT INTO channels (channel_id, name, status) VALUES (?, ?, 'active')",
                params![channel_id, name],
            )?;
            Ok((conn.last_insert_rowid(), true))
        }
    }

    pub fn get_channels(&self) -> Result<Vec<Channel>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM channels ORDER BY id", CHANNEL_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    pub fn get_active_channels(&self) -> Result<Vec<Channel>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM channels WHERE status = 'active' ORDER BY id",
            CHANNEL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let channels = stmt
            .query_map([], channel_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    /// Returns false when no channel matches the natural key.
    pub fn set_channel_status(&self, channel_id: &str, status: ChannelStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE channels SET status = ?, consecutive_failures = 0 WHERE channel_id = ?",
            params![status.as_str(), channel_id],
        )?;
        Ok(changed == 1)
    }

    /// Record a successful poll: stamp last_checked, clear the failure streak,
    /// and bump the found counter by the newly registered count.
    pub fn touch_channel_checked(&self, id: i64, newly_found: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channels SET last_checked = datetime('now'), consecutive_failures = 0,
                    videos_found = videos_found + ? WHERE id = ?",
            params![newly_found, id],
        )?;
        Ok(())
    }

    /// Record a failed poll. A permanent error flips the channel to `error`
    /// immediately; transient errors flip it after `threshold` consecutive
    /// failures. Returns the status after the update.
    pub fn record_channel_failure(
        &self,
        id: i64,
        permanent: bool,
        threshold: i64,
    ) -> Result<ChannelStatus> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channels SET consecutive_failures = consecutive_failures + 1 WHERE id = ?",
            params![id],
        )?;
        let failures: i64 = conn.query_row(
            "SELECT consecutive_failures FROM channels WHERE id = ?",
            params![id],
            |row| row.get(0),
        )?;
        if permanent || failures >= threshold {
            conn.execute(
                "UPDATE channels SET status = 'error' WHERE id = ? AND status = 'active'",
                params![id],
            )?;
        }
        let status: String = conn.query_row(
            "SELECT status FROM channels WHERE id = ?",
            params![id],
            |row| row.get(0),
        )?;
        Ok(status.into())
    }

    pub fn increment_channel_processed(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channels SET videos_processed = videos_processed + 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    /// Recompute the cached per-channel counters from video rows. The counters
    /// are a cache; this is the source of truth they must agree with.
    pub fn recount_channel_counters(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE channels SET
                videos_found = (SELECT COUNT(*) FROM videos WHERE videos.channel_id = channels.id),
                videos_processed = (SELECT COUNT(*) FROM videos
                                    WHERE videos.channel_id = channels.id
                                      AND videos.fetched_at IS NOT NULL)",
            [],
        )?;
        Ok(count)
    }

    // =========================================================================
    // Video registry
    // =========================================================================

    /// Register a video by natural key. Repeat calls refresh mutable metadata
    /// (title, counts) but never touch stage or retry bookkeeping.
    pub fn register_video(&self, video: &NewVideo) -> Result<RegisterOutcome> {
        let conn = self.conn.lock().unwrap();

        let existing_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM videos WHERE video_id = ?",
                params![video.video_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing_id {
            conn.execute(
                "UPDATE videos SET
                    title = ?,
                    description = COALESCE(?, description),
                    thumbnail_url = COALESCE(?, thumbnail_url),
                    duration_secs = COALESCE(?, duration_secs),
                    view_count = COALESCE(?, view_count),
                    published_at = COALESCE(?, published_at)
                 WHERE id = ?",
                params![
                    video.title,
                    video.description,
                    video.thumbnail_url,
                    video.duration_secs,
                    video.view_count,
                    video.published_at,
                    id
                ],
            )?;
            Ok(RegisterOutcome::AlreadyExists(id))
        } else {
            conn.execute(
                "INSERT INTO videos (video_id, channel_id, title, description, url,
                                     thumbnail_url, duration_secs, view_count, published_at, stage)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'discovered')",
                params![
                    video.video_id,
                    video.channel_id,
                    video.title,
                    video.description,
                    video.url,
                    video.thumbnail_url,
                    video.duration_secs,
                    video.view_count,
                    video.published_at
                ],
            )?;
            Ok(RegisterOutcome::Created(conn.last_insert_rowid()))
        }
    }

    pub fn get_video(&self, id: i64) -> Result<Option<Video>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM videos WHERE id = ?", VIDEO_COLUMNS);
        let video = conn
            .query_row(&sql, params![id], video_from_row)
            .optional()?;
        Ok(video)
    }

    pub fn get_video_by_natural_key(&self, video_id: &str) -> Result<Option<Video>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM videos WHERE video_id = ?", VIDEO_COLUMNS);
        let video = conn
            .query_row(&sql, params![video_id], video_from_row)
            .optional()?;
        Ok(video)
    }

    /// Compare-and-swap stage transition. The update only applies while the
    /// row still holds `from`; a miss reports the actual stage so the caller
    /// can skip. Illegal from/to pairs are caller bugs and error out.
    pub fn advance(&self, video_id: i64, from: Stage, to: Stage) -> Result<AdvanceOutcome> {
        if !from.can_advance_to(to) {
            bail!("illegal stage transition {} -> {}", from, to);
        }

        let conn = self.conn.lock().unwrap();
        let sql = match to {
            Stage::Fetched => {
                "UPDATE videos SET stage = ?1, fetched_at = datetime('now'),
                        failed_from = NULL, next_retry_at = NULL
                 WHERE id = ?2 AND stage = ?3"
            }
            Stage::Transcribed => {
                "UPDATE videos SET stage = ?1, transcribed_at = datetime('now'), has_transcript = 1,
                        failed_from = NULL, next_retry_at = NULL
                 WHERE id = ?2 AND stage = ?3"
            }
            Stage::Enriched => {
                "UPDATE videos SET stage = ?1, enriched_at = datetime('now'), has_enrichment = 1,
                        failed_from = NULL, next_retry_at = NULL
                 WHERE id = ?2 AND stage = ?3"
            }
            _ => {
                "UPDATE videos SET stage = ?1, failed_from = NULL, next_retry_at = NULL
                 WHERE id = ?2 AND stage = ?3"
            }
        };

        let changed = conn.execute(sql, params![to.as_str(), video_id, from.as_str()])?;
        if changed == 1 {
            return Ok(AdvanceOutcome::Advanced);
        }

        let actual: Option<String> = conn
            .query_row(
                "SELECT stage FROM videos WHERE id = ?",
                params![video_id],
                |row| row.get(0),
            )
            .optional()?;
        match actual {
            Some(s) => Ok(AdvanceOutcome::Stale { actual: s.into() }),
            None => bail!("video {} not found", video_id),
        }
    }

    /// Record the fetch artifact location. Set-once: an already-recorded path
    /// is never overwritten, a differing value is logged and dropped.
    pub fn record_artifact(&self, video_id: i64, path: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE videos SET audio_path = ?2 WHERE id = ?1 AND audio_path IS NULL",
            params![video_id, path],
        )?;
        if changed == 1 {
            return Ok(true);
        }

        let existing: Option<String> = conn
            .query_row(
                "SELECT audio_path FROM videos WHERE id = ?",
                params![video_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        if let Some(existing) = existing {
            if existing != path {
                tracing::warn!(
                    "artifact path for video {} already set to {}, ignoring {}",
                    video_id,
                    existing,
                    path
                );
            }
        }
        Ok(false)
    }

    /// Record a failure while the item holds `from`. Increments the attempt
    /// count and either schedules a backoff retry, parks the item (not
    /// retryable), or abandons it once the policy's ceiling is reached.
    pub fn mark_failed(
        &self,
        video_id: i64,
        from: Stage,
        error: &str,
        retryable: bool,
        policy: &RetryPolicy,
    ) -> Result<FailOutcome> {
        let conn = self.conn.lock().unwrap();

        let current: Option<(String, i64)> = conn
            .query_row(
                "SELECT stage, attempts FROM videos WHERE id = ?",
                params![video_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (stage, attempts) = match current {
            Some(row) => row,
            None => bail!("video {} not found", video_id),
        };
        let stage: Stage = stage.into();
        if stage != from {
            return Ok(FailOutcome::Stale { actual: stage });
        }

        let attempts = attempts + 1;
        if retryable && policy.is_exhausted(attempts) {
            conn.execute(
                "UPDATE videos SET stage = 'abandoned', failed_from = ?2, last_error = ?3,
                        attempts = ?4, next_retry_at = NULL
                 WHERE id = ?1 AND stage = ?5",
                params![video_id, from.as_str(), error, attempts, from.as_str()],
            )?;
            Ok(FailOutcome::Abandoned { attempts })
        } else {
            let next_retry_at = if retryable {
                Some(rfc3339(policy.next_retry_at(attempts, Utc::now())))
            } else {
                None
            };
            conn.execute(
                "UPDATE videos SET stage = 'failed', failed_from = ?2, last_error = ?3,
                        attempts = ?4, next_retry_at = ?5
                 WHERE id = ?1 AND stage = ?6",
                params![
                    video_id,
                    from.as_str(),
                    error,
                    attempts,
                    next_retry_at,
                    from.as_str()
                ],
            )?;
            Ok(FailOutcome::Failed {
                attempts,
                next_retry_at,
            })
        }
    }

    /// Return failed items whose backoff has elapsed to the stage they fell
    /// from. Parked items (no next_retry_at) and abandoned items stay put.
    pub fn promote_due_retries(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE videos SET stage = failed_from, failed_from = NULL, next_retry_at = NULL
             WHERE stage = 'failed'
               AND failed_from IS NOT NULL
               AND next_retry_at IS NOT NULL
               AND next_retry_at <= ?",
            params![rfc3339(now)],
        )?;
        if count > 0 {
            tracing::info!("promoted {} failed items for retry", count);
        }
        Ok(count)
    }

    /// Manual reset. By default a failed or abandoned item returns to the
    /// stage it fell from with a fresh attempt budget. With `to_fetched` the
    /// item drops back to `fetched` so the next deposited transcript file is
    /// stored as a new version.
    pub fn reset_video(&self, natural_key: &str, to_fetched: bool) -> Result<Option<Stage>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(i64, String, Option<String>)> = conn
            .query_row(
                "SELECT id, stage, failed_from FROM videos WHERE video_id = ?",
                params![natural_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (id, stage, failed_from) = match row {
            Some(r) => r,
            None => return Ok(None),
        };
        let stage: Stage = stage.into();

        let target = if to_fetched {
            match stage {
                Stage::Fetched | Stage::Transcribed | Stage::Enriched
                | Stage::Failed | Stage::Abandoned => Stage::Fetched,
                _ => return Ok(None),
            }
        } else {
            match stage {
                Stage::Failed | Stage::Abandoned => failed_from
                    .map(Into::into)
                    .unwrap_or(Stage::Discovered),
                _ => return Ok(None),
            }
        };

        conn.execute(
            "UPDATE videos SET stage = ?, failed_from = NULL, last_error = NULL,
                    attempts = 0, next_retry_at = NULL
             WHERE id = ?",
            params![target.as_str(), id],
        )?;
        Ok(Some(target))
    }

    /// Work-list for the fetch pass: freshly discovered items plus claims
    /// that survived a crash or came back from retry promotion.
    pub fn fetch_worklist(&self) -> Result<Vec<Video>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM videos WHERE stage IN ('discovered', 'fetch_pending') ORDER BY id",
            VIDEO_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let videos = stmt
            .query_map([], video_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(videos)
    }

    pub fn videos_in_stage(&self, stage: Stage) -> Result<Vec<Video>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM videos WHERE stage = ? ORDER BY id",
            VIDEO_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let videos = stmt
            .query_map(params![stage.as_str()], video_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(videos)
    }

    pub fn stage_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT stage, COUNT(*) FROM videos GROUP BY stage ORDER BY stage")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    // =========================================================================
    // Transcripts
    // =========================================================================

    /// Store a transcript and advance the item to `transcribed` in one
    /// transaction. Skips (without writing) unless the item is at `fetched`,
    /// which is what makes re-polling the watched folder idempotent.
    pub fn store_transcript_and_advance(
        &self,
        video_id: i64,
        body: &str,
        engine: &str,
        language: Option<&str>,
    ) -> Result<StoreOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stage: Option<String> = tx
            .query_row(
                "SELECT stage FROM videos WHERE id = ?",
                params![video_id],
                |row| row.get(0),
            )
            .optional()?;
        let stage: Stage = match stage {
            Some(s) => s.into(),
            None => bail!("video {} not found", video_id),
        };
        if stage != Stage::Fetched {
            return Ok(StoreOutcome::Skipped { stage });
        }

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM transcripts WHERE video_id = ? AND engine = ?",
            params![video_id, engine],
            |row| row.get(0),
        )?;
        let word_count = body.split_whitespace().count() as i64;

        tx.execute(
            "INSERT INTO transcripts (video_id, body, word_count, engine, version, language)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![video_id, body, word_count, engine, version, language],
        )?;
        let transcript_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE videos SET stage = 'transcribed', has_transcript = 1,
                    transcribed_at = datetime('now'), failed_from = NULL, next_retry_at = NULL
             WHERE id = ?",
            params![video_id],
        )?;

        tx.commit()?;
        Ok(StoreOutcome::Stored { id: transcript_id })
    }

    /// Latest transcript version for an item.
    pub fn get_transcript_for_video(&self, video_id: i64) -> Result<Option<Transcript>> {
        let conn = self.conn.lock().unwrap();
        let transcript = conn
            .query_row(
                "SELECT id, video_id, body, word_count, engine, version, language, embedding, created_at
                 FROM transcripts WHERE video_id = ? ORDER BY version DESC, id DESC LIMIT 1",
                params![video_id],
                |row| {
                    Ok(Transcript {
                        id: row.get(0)?,
                        video_id: row.get(1)?,
                        body: row.get(2)?,
                        word_count: row.get(3)?,
                        engine: row.get(4)?,
                        version: row.get(5)?,
                        language: row.get(6)?,
                        embedding: row
                            .get::<_, Option<Vec<u8>>>(7)?
                            .map(|b| embedding_from_bytes(&b)),
                        created_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(transcript)
    }

    /// Attach an embedding vector to a transcript. Set-once; returns false if
    /// one was already stored.
    pub fn set_transcript_embedding(&self, transcript_id: i64, embedding: &[f32]) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE transcripts SET embedding = ?2 WHERE id = ?1 AND embedding IS NULL",
            params![transcript_id, embedding_to_bytes(embedding)],
        )?;
        Ok(changed == 1)
    }

    /// Nearest-neighbor search over stored transcript embeddings (cosine,
    /// latest version per item).
    pub fn semantic_search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchHit>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT v.video_id, v.title, t.embedding
             FROM transcripts t
             JOIN videos v ON v.id = t.video_id
             WHERE t.embedding IS NOT NULL
               AND t.id = (SELECT MAX(t2.id) FROM transcripts t2 WHERE t2.video_id = t.video_id)",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|(video_id, title, blob)| {
                let embedding = embedding_from_bytes(&blob);
                SearchHit {
                    video_id,
                    title,
                    score: cosine(query, &embedding),
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    // =========================================================================
    // Enrichments
    // =========================================================================

    /// Store an enrichment and advance the item to `enriched` in one
    /// transaction. Skips unless the item is still at `transcribed`.
    #[allow(clippy::too_many_arguments)]
    pub fn store_enrichment_and_advance(
        &self,
        video_id: i64,
        transcript_id: i64,
        summary: &str,
        chapters_json: &str,
        key_points_json: &str,
        model: &str,
        tokens_used: Option<i64>,
        latency_ms: Option<i64>,
    ) -> Result<StoreOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stage: Option<String> = tx
            .query_row(
                "SELECT stage FROM videos WHERE id = ?",
                params![video_id],
                |row| row.get(0),
            )
            .optional()?;
        let stage: Stage = match stage {
            Some(s) => s.into(),
            None => bail!("video {} not found", video_id),
        };
        if stage != Stage::Transcribed {
            return Ok(StoreOutcome::Skipped { stage });
        }

        tx.execute(
            "INSERT INTO enrichments (transcript_id, summary, chapters_json, key_points_json,
                                      model, tokens_used, latency_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                transcript_id,
                summary,
                chapters_json,
                key_points_json,
                model,
                tokens_used,
                latency_ms
            ],
        )?;
        let enrichment_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE videos SET stage = 'enriched', has_enrichment = 1,
                    enriched_at = datetime('now'), failed_from = NULL, next_retry_at = NULL
             WHERE id = ?",
            params![video_id],
        )?;

        tx.commit()?;
        Ok(StoreOutcome::Stored { id: enrichment_id })
    }

    /// Latest enrichment for an item, via its newest transcript.
    pub fn get_enrichment_for_video(&self, video_id: i64) -> Result<Option<Enrichment>> {
        let conn = self.conn.lock().unwrap();
        let enrichment = conn
            .query_row(
                "SELECT e.id, e.transcript_id, e.summary, e.chapters_json, e.key_points_json,
                        e.model, e.tokens_used, e.latency_ms, e.created_at
                 FROM enrichments e
                 JOIN transcripts t ON t.id = e.transcript_id
                 WHERE t.video_id = ?
                 ORDER BY e.id DESC LIMIT 1",
                params![video_id],
                |row| {
                    Ok(Enrichment {
                        id: row.get(0)?,
                        transcript_id: row.get(1)?,
                        summary: row.get(2)?,
                        chapters_json: row.get(3)?,
                        key_points_json: row.get(4)?,
                        model: row.get(5)?,
                        tokens_used: row.get(6)?,
                        latency_ms: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(enrichment)
    }

    pub fn store_totals(&self) -> Result<(i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let transcripts: i64 =
            conn.query_row("SELECT COUNT(*) FROM transcripts", [], |row| row.get(0))?;
        let enrichments: i64 =
            conn.query_row("SELECT COUNT(*) FROM enrichments", [], |row| row.get(0))?;
        Ok((transcripts, enrichments))
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT value FROM settings WHERE key = ?",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now],
        )?;
        Ok(())
    }
}

// =========================================================================
// Row mapping and vector helpers
// =========================================================================

fn video_from_row(row: &rusqlite::Row) -> rusqlite::Result<Video> {
    Ok(Video {
        id: row.get(0)?,
        video_id: row.get(1)?,
        channel_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        url: row.get(5)?,
        thumbnail_url: row.get(6)?,
        duration_secs: row.get(7)?,
        view_count: row.get(8)?,
        published_at: row.get(9)?,
        stage: row.get::<_, String>(10)?.into(),
        failed_from: row.get::<_, Option<String>>(11)?.map(Into::into),
        last_error: row.get(12)?,
        attempts: row.get(13)?,
        next_retry_at: row.get(14)?,
        audio_path: row.get(15)?,
        has_transcript: row.get::<_, i32>(16)? == 1,
        has_enrichment: row.get::<_, i32>(17)? == 1,
        discovered_at: row.get(18)?,
        fetched_at: row.get(19)?,
        transcribed_at: row.get(20)?,
        enriched_at: row.get(21)?,
    })
}

fn channel_from_row(row: &rusqlite::Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get::<_, String>(3)?.into(),
        consecutive_failures: row.get(4)?,
        last_checked: row.get(5)?,
        videos_found: row.get(6)?,
        videos_processed: row.get(7)?,
        added_date: row.get(8)?,
    })
}

/// Fixed-width UTC timestamp so stored retry times compare lexicographically.
fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
