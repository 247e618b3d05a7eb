//! Viewport-gated attention accounting.
//!
//! Each tracked post accumulates wall-clock time while it is visible and no
//! pause reason is active. Every transition out of the running state flushes
//! exactly one additive delta to the store; a flushed interval is never
//! counted twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::Database;
use crate::taxonomy::SCORE_NOISE_FLOOR;

/// Why a visible post's timer is not running. A set of reasons replaces
/// independent booleans so a new gate is a data change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseReason {
    Hover,
    Screened,
    TabHidden,
}

#[derive(Debug)]
struct TrackedPost {
    visible: bool,
    pauses: HashSet<PauseReason>,
    /// Set exactly while the timer is running; taking it ends the interval.
    anchor: Option<Instant>,
}

impl TrackedPost {
    fn new() -> Self {
        Self {
            visible: false,
            pauses: HashSet::new(),
            anchor: None,
        }
    }

    fn should_run(&self) -> bool {
        self.visible && self.pauses.is_empty()
    }

    fn start_if_eligible(&mut self) {
        if self.should_run() && self.anchor.is_none() {
            self.anchor = Some(Instant::now());
        }
    }

    fn take_elapsed(&mut self) -> Option<Duration> {
        self.anchor.take().map(|anchor| anchor.elapsed())
    }
}

pub struct AttentionTimer {
    posts: Arc<Mutex<HashMap<String, TrackedPost>>>,
    db: Database,
}

impl Clone for AttentionTimer {
    fn clone(&self) -> Self {
        Self {
            posts: Arc::clone(&self.posts),
            db: self.db.clone(),
        }
    }
}

impl AttentionTimer {
    pub fn new(db: Database) -> Self {
        Self {
            posts: Arc::new(Mutex::new(HashMap::new())),
            db,
        }
    }

    /// Register a post for attention tracking. Safe to call repeatedly.
    pub async fn track(&self, post_id: &str) {
        self.posts
            .lock()
            .await
            .entry(post_id.to_string())
            .or_insert_with(TrackedPost::new);
    }

    pub async fn viewport_entered(&self, post_id: &str) {
        let mut posts = self.posts.lock().await;
        let post = posts
            .entry(post_id.to_string())
            .or_insert_with(TrackedPost::new);
        post.visible = true;
        post.start_if_eligible();
    }

    pub async fn viewport_exited(&self, post_id: &str) {
        let elapsed = {
            let mut posts = self.posts.lock().await;
            let Some(post) = posts.get_mut(post_id) else {
                return;
            };
            let elapsed = post.take_elapsed();
            post.visible = false;
            elapsed
        };

        if let Some(elapsed) = elapsed {
            self.flush(post_id, elapsed).await;
        }
    }

    pub async fn hover_started(&self, post_id: &str) {
        self.pause(post_id, PauseReason::Hover).await;
    }

    pub async fn hover_ended(&self, post_id: &str) {
        self.resume(post_id, PauseReason::Hover).await;
    }

    pub async fn pause_for_screen(&self, post_id: &str) {
        self.pause(post_id, PauseReason::Screened).await;
    }

    pub async fn resume_from_screen(&self, post_id: &str) {
        self.resume(post_id, PauseReason::Screened).await;
    }

    /// The containing tab went hidden: one global transition flushing every
    /// running post.
    pub async fn tab_hidden(&self) {
        let flushes = {
            let mut posts = self.posts.lock().await;
            let mut flushes = Vec::new();
            for (post_id, post) in posts.iter_mut() {
                if let Some(elapsed) = post.take_elapsed() {
                    flushes.push((post_id.clone(), elapsed));
                }
                post.pauses.insert(PauseReason::TabHidden);
            }
            flushes
        };

        for (post_id, elapsed) in flushes {
            self.flush(&post_id, elapsed).await;
        }
    }

    pub async fn tab_visible(&self) {
        let mut posts = self.posts.lock().await;
        for post in posts.values_mut() {
            post.pauses.remove(&PauseReason::TabHidden);
            post.start_if_eligible();
        }
    }

    /// Drop tracking state for posts whose elements left the document. No
    /// final flush: a stale element's open interval is lost by design.
    pub async fn prune_detached<F>(&self, mut is_detached: F)
    where
        F: FnMut(&str) -> bool,
    {
        let mut posts = self.posts.lock().await;
        posts.retain(|post_id, _| !is_detached(post_id));
    }

    pub async fn is_tracked(&self, post_id: &str) -> bool {
        self.posts.lock().await.contains_key(post_id)
    }

    async fn pause(&self, post_id: &str, reason: PauseReason) {
        let elapsed = {
            let mut posts = self.posts.lock().await;
            let Some(post) = posts.get_mut(post_id) else {
                return;
            };
            let elapsed = post.take_elapsed();
            post.pauses.insert(reason);
            elapsed
        };

        if let Some(elapsed) = elapsed {
            self.flush(post_id, elapsed).await;
        }
    }

    async fn resume(&self, post_id: &str, reason: PauseReason) {
        let mut posts = self.posts.lock().await;
        let Some(post) = posts.get_mut(post_id) else {
            return;
        };
        post.pauses.remove(&reason);
        post.start_if_eligible();
    }

    /// Persist one interval's delta and credit the daily usage ledger for the
    /// post's significant categories.
    async fn flush(&self, post_id: &str, elapsed: Duration) {
        let delta_ms = elapsed.as_millis() as u64;
        if let Err(err) = self.db.update_time_spent(post_id, delta_ms).await {
            error!("failed to persist attention delta for post {post_id}: {err:#}");
            return;
        }

        let entry = match self.db.get_post(post_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(err) => {
                warn!("failed to load post {post_id} for usage crediting: {err:#}");
                return;
            }
        };
        let Some(classification) = entry.classification else {
            return;
        };

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let seconds = delta_ms as f64 / 1000.0;
        for (category, scores) in &classification.categories {
            if scores.total_score < SCORE_NOISE_FLOOR {
                continue;
            }
            if let Err(err) = self.db.add_usage(&day, category, None, seconds).await {
                warn!("failed to credit usage for {category}: {err:#}");
            }
            for (subcategory, score) in &scores.subcategories {
                if *score < SCORE_NOISE_FLOOR {
                    continue;
                }
                if let Err(err) = self
                    .db
                    .add_usage(&day, category, Some(subcategory), seconds)
                    .await
                {
                    warn!("failed to credit usage for {category}/{subcategory}: {err:#}");
                }
            }
        }
    }
}
