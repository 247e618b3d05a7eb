use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;

mod migrations;
pub mod models;

use migrations::run_migrations;
pub use models::{PostCacheEntry, PostData, PostMetadata, PostPatch, PostState};

use crate::tasks::Task;
use crate::taxonomy::{ClassificationResult, ClassificationSource};

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("value {value} is negative"))
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn state_from_str(value: &str) -> Result<PostState> {
    PostState::from_str(value).ok_or_else(|| anyhow!("unknown post state '{value}'"))
}

fn read_entry(row: &rusqlite::Row<'_>) -> Result<PostCacheEntry> {
    let post_data: Option<String> = row.get(2)?;
    let classification: Option<String> = row.get(3)?;
    let source: Option<String> = row.get(4)?;
    let tasks: String = row.get(6)?;

    Ok(PostCacheEntry {
        id: row.get::<_, String>(0)?,
        post_data: post_data
            .map(|json| serde_json::from_str::<PostData>(&json))
            .transpose()
            .context("invalid postData JSON")?,
        classification: classification
            .map(|json| serde_json::from_str::<ClassificationResult>(&json))
            .transpose()
            .context("invalid classification JSON")?,
        classification_source: source.as_deref().and_then(ClassificationSource::from_str),
        state: state_from_str(&row.get::<_, String>(5)?)?,
        tasks: serde_json::from_str::<Vec<Task>>(&tasks).context("invalid tasks JSON")?,
        accumulated_text: row.get::<_, String>(7)?,
        metadata: PostMetadata {
            last_seen: parse_datetime(&row.get::<_, String>(8)?)?,
            time_spent_ms: to_u64(row.get::<_, i64>(9)?)?,
            platform: row.get::<_, String>(1)?,
            screen_active: row.get::<_, i64>(10)? != 0,
        },
    })
}

const ENTRY_COLUMNS: &str = "id, platform, post_data, classification, classification_source, \
     state, tasks, accumulated_text, last_seen, time_spent_ms, screen_active";

/// Handle to the post cache. All access is serialized through a dedicated
/// worker thread owning the SQLite connection; callers await a oneshot reply.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("scrollguard-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<PostCacheEntry>> {
        let post_id = post_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM posts WHERE id = ?1"),
                params![post_id],
                |row| Ok(read_entry(row)),
            )
            .optional()
            .context("failed to query post")?
            .transpose()
        })
        .await
    }

    /// Insert a fresh `pending` entry for a newly observed post. Returns the
    /// stored entry; an existing entry for the id is returned unchanged.
    pub async fn create_pending_entry(&self, post: &PostData) -> Result<PostCacheEntry> {
        let record = post.clone();
        self.execute(move |conn| {
            let now = Utc::now().to_rfc3339();
            let post_json =
                serde_json::to_string(&record).context("failed to serialize postData")?;
            conn.execute(
                "INSERT OR IGNORE INTO posts
                     (id, platform, post_data, state, tasks, accumulated_text,
                      last_seen, time_spent_ms, screen_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', '[]', '', ?4, 0, 0, ?4, ?4)",
                params![record.id, record.platform, post_json, now],
            )
            .context("failed to insert pending post entry")?;

            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM posts WHERE id = ?1"),
                params![record.id],
                |row| Ok(read_entry(row)),
            )
            .context("failed to read back pending post entry")?
        })
        .await
    }

    /// Apply a partial update; absent fields leave columns untouched.
    pub async fn update_post(&self, post_id: &str, patch: PostPatch) -> Result<()> {
        let post_id = post_id.to_string();
        self.execute(move |conn| {
            let (classification_json, source) = match &patch.classification {
                Some((result, source)) => (
                    Some(
                        serde_json::to_string(result)
                            .context("failed to serialize classification")?,
                    ),
                    Some(source.as_str()),
                ),
                None => (None, None),
            };
            let tasks_json = patch
                .tasks
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("failed to serialize tasks")?;

            let updated = conn
                .execute(
                    "UPDATE posts
                     SET state = COALESCE(?1, state),
                         classification = COALESCE(?2, classification),
                         classification_source = COALESCE(?3, classification_source),
                         tasks = COALESCE(?4, tasks),
                         accumulated_text = COALESCE(?5, accumulated_text),
                         last_seen = COALESCE(?6, last_seen),
                         screen_active = COALESCE(?7, screen_active),
                         updated_at = ?8
                     WHERE id = ?9",
                    params![
                        patch.state.map(|s| s.as_str()),
                        classification_json,
                        source,
                        tasks_json,
                        patch.accumulated_text,
                        patch.last_seen.map(|dt| dt.to_rfc3339()),
                        patch.screen_active.map(|b| b as i64),
                        Utc::now().to_rfc3339(),
                        post_id,
                    ],
                )
                .context("failed to update post")?;

            if updated == 0 {
                return Err(anyhow!("no post entry for id {post_id}"));
            }
            Ok(())
        })
        .await
    }

    /// Additive read-modify-write of accumulated attention time. Creates a
    /// minimal entry when the post has never been cached.
    pub async fn update_time_spent(&self, post_id: &str, delta_ms: u64) -> Result<()> {
        let post_id = post_id.to_string();
        self.execute(move |conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn
                .execute(
                    "UPDATE posts
                     SET time_spent_ms = time_spent_ms + ?1,
                         last_seen = ?2,
                         updated_at = ?2
                     WHERE id = ?3",
                    params![to_i64(delta_ms)?, now, post_id],
                )
                .context("failed to add time spent")?;

            if updated == 0 {
                conn.execute(
                    "INSERT INTO posts
                         (id, state, tasks, accumulated_text, last_seen,
                          time_spent_ms, screen_active, created_at, updated_at)
                     VALUES (?1, 'pending', '[]', '', ?2, ?3, 0, ?2, ?2)",
                    params![post_id, now, to_i64(delta_ms)?],
                )
                .context("failed to insert minimal post entry for time spent")?;
            }
            Ok(())
        })
        .await
    }

    pub async fn list_posts_in_state(&self, state: PostState) -> Result<Vec<PostCacheEntry>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM posts WHERE state = ?1 ORDER BY last_seen DESC"
            ))?;

            let mut rows = stmt.query(params![state.as_str()])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(read_entry(row)?);
            }
            Ok(entries)
        })
        .await
    }

    /// Credit attention seconds against a category (and optionally one of its
    /// subcategories) for the given day.
    pub async fn add_usage(
        &self,
        day: &str,
        category: &str,
        subcategory: Option<&str>,
        seconds: f64,
    ) -> Result<()> {
        let day = day.to_string();
        let category = category.to_string();
        let subcategory = subcategory.unwrap_or("").to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO daily_usage (day, category, subcategory, seconds)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(day, category, subcategory)
                 DO UPDATE SET seconds = seconds + excluded.seconds",
                params![day, category, subcategory, seconds],
            )
            .context("failed to record daily usage")?;
            Ok(())
        })
        .await
    }

    pub async fn consumed_seconds(
        &self,
        day: &str,
        category: &str,
        subcategory: Option<&str>,
    ) -> Result<f64> {
        let day = day.to_string();
        let category = category.to_string();
        let subcategory = subcategory.unwrap_or("").to_string();
        self.execute(move |conn| {
            let seconds: Option<f64> = conn
                .query_row(
                    "SELECT seconds FROM daily_usage
                     WHERE day = ?1 AND category = ?2 AND subcategory = ?3",
                    params![day, category, subcategory],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to query daily usage")?;
            Ok(seconds.unwrap_or(0.0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskKind, TaskStatus, TextSource};

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("cache.sqlite3")).unwrap();
        (dir, db)
    }

    fn sample_post(id: &str) -> PostData {
        PostData {
            id: id.to_string(),
            platform: "twitter".into(),
            author: Some("ada".into()),
            text: Some("hello".into()),
            image_urls: vec![],
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (_dir, db) = test_db();
        let entry = db.create_pending_entry(&sample_post("p1")).await.unwrap();
        assert_eq!(entry.state, PostState::Pending);
        assert_eq!(entry.metadata.platform, "twitter");

        let fetched = db.get_post("p1").await.unwrap().unwrap();
        assert_eq!(fetched.post_data.unwrap(), sample_post("p1"));
        assert!(db.get_post("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let (_dir, db) = test_db();
        db.create_pending_entry(&sample_post("p1")).await.unwrap();
        db.update_post(
            "p1",
            PostPatch {
                state: Some(PostState::Analyzing),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // A second create must not reset the existing entry.
        let entry = db.create_pending_entry(&sample_post("p1")).await.unwrap();
        assert_eq!(entry.state, PostState::Analyzing);
    }

    #[tokio::test]
    async fn partial_update_leaves_other_columns() {
        let (_dir, db) = test_db();
        db.create_pending_entry(&sample_post("p1")).await.unwrap();

        let mut task = Task::new(TaskKind::TextExtraction(TextSource::PostBody));
        task.status = TaskStatus::Running;
        db.update_post(
            "p1",
            PostPatch {
                tasks: Some(vec![task]),
                accumulated_text: Some("hello".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        db.update_post(
            "p1",
            PostPatch {
                state: Some(PostState::Analyzing),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let entry = db.get_post("p1").await.unwrap().unwrap();
        assert_eq!(entry.state, PostState::Analyzing);
        assert_eq!(entry.accumulated_text, "hello");
        assert_eq!(entry.tasks.len(), 1);
    }

    #[tokio::test]
    async fn update_post_for_unknown_id_errors() {
        let (_dir, db) = test_db();
        let err = db.update_post("nope", PostPatch::default()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn time_spent_is_additive_and_creates_minimal_entry() {
        let (_dir, db) = test_db();
        db.update_time_spent("ghost", 1500).await.unwrap();
        db.update_time_spent("ghost", 500).await.unwrap();

        let entry = db.get_post("ghost").await.unwrap().unwrap();
        assert_eq!(entry.metadata.time_spent_ms, 2000);
        assert_eq!(entry.state, PostState::Pending);
        assert!(entry.post_data.is_none());
    }

    #[tokio::test]
    async fn usage_ledger_accumulates_per_day() {
        let (_dir, db) = test_db();
        db.add_usage("2026-08-07", "news", None, 30.0).await.unwrap();
        db.add_usage("2026-08-07", "news", None, 12.5).await.unwrap();
        db.add_usage("2026-08-07", "news", Some("world"), 10.0)
            .await
            .unwrap();

        let total = db.consumed_seconds("2026-08-07", "news", None).await.unwrap();
        assert!((total - 42.5).abs() < 1e-9);
        let sub = db
            .consumed_seconds("2026-08-07", "news", Some("world"))
            .await
            .unwrap();
        assert!((sub - 10.0).abs() < 1e-9);
        let other_day = db.consumed_seconds("2026-08-08", "news", None).await.unwrap();
        assert_eq!(other_day, 0.0);
    }

    #[tokio::test]
    async fn list_posts_in_state_filters() {
        let (_dir, db) = test_db();
        db.create_pending_entry(&sample_post("p1")).await.unwrap();
        db.create_pending_entry(&sample_post("p2")).await.unwrap();
        db.update_post(
            "p2",
            PostPatch {
                state: Some(PostState::Analyzing),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let analyzing = db.list_posts_in_state(PostState::Analyzing).await.unwrap();
        assert_eq!(analyzing.len(), 1);
        assert_eq!(analyzing[0].id, "p2");
    }
}
