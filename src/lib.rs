pub mod adapters;
pub mod attention;
pub mod reconcile;
pub mod settings;
pub mod store;
pub mod tasks;
pub mod taxonomy;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use adapters::{Classifier, RemoteAnalysis, ScreenControl, TextExtractor};
use attention::AttentionTimer;
use reconcile::Reconciler;
use settings::SettingsStore;
use store::{Database, PostData, PostPatch, PostState};
use tasks::{TaskEvent, TaskKind, TaskOrchestrator, TaskRegistry};

/// The external collaborators injected into an engine instance.
pub struct EngineAdapters {
    pub extractors: Vec<Arc<dyn TextExtractor>>,
    pub remote: Arc<dyn RemoteAnalysis>,
    pub classifier: Arc<dyn Classifier>,
    pub screen: Arc<dyn ScreenControl>,
}

/// Wires the orchestrator, reconciler and attention timer around one store.
/// Instances are fully isolated: all per-post state lives in injected
/// registries, never in module globals.
pub struct Engine {
    db: Database,
    registry: Arc<TaskRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    reconciler: Arc<Reconciler>,
    attention: AttentionTimer,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(db: Database, settings: Arc<SettingsStore>, adapters: EngineAdapters) -> Self {
        let cancel = CancellationToken::new();
        let registry = Arc::new(TaskRegistry::new());
        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::clone(&registry),
            adapters.extractors,
            adapters.remote,
            cancel.clone(),
        ));
        let attention = AttentionTimer::new(db.clone());
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            Arc::clone(&registry),
            adapters.classifier,
            adapters.screen,
            settings,
            attention.clone(),
        ));

        Self {
            db,
            registry,
            orchestrator,
            reconciler,
            attention,
            cancel,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn attention(&self) -> &AttentionTimer {
        &self.attention
    }

    /// Handle a post appearing in the feed. First sighting creates a cache
    /// entry and starts the task set; a re-sighting refreshes `last_seen`,
    /// and restarts analysis if the task state was lost across a restart.
    pub async fn observe_post(&self, post: PostData) -> Result<()> {
        self.attention.track(&post.id).await;

        match self.db.get_post(&post.id).await? {
            Some(entry) => {
                self.db
                    .update_post(
                        &post.id,
                        PostPatch {
                            last_seen: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;

                let in_flight = matches!(entry.state, PostState::Pending | PostState::Analyzing);
                if in_flight && !self.registry.contains(&post.id).await {
                    info!("post {}: analysis state lost, restarting task set", post.id);
                    self.start_analysis(post).await?;
                }
            }
            None => {
                self.db.create_pending_entry(&post).await?;
                self.start_analysis(post).await?;
            }
        }

        Ok(())
    }

    /// Re-observe posts the store says were mid-analysis when the previous
    /// session ended.
    pub async fn recover_incomplete(&self) -> Result<usize> {
        let mut recovered = 0;
        for entry in self.db.list_posts_in_state(PostState::Analyzing).await? {
            if self.registry.contains(&entry.id).await {
                continue;
            }
            let Some(post) = entry.post_data else {
                continue;
            };
            warn!(
                "Recovered in-flight analysis for post {}; restarting task set",
                post.id
            );
            self.start_analysis(post).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Append one more task of `kind` to an already-initialized post.
    pub async fn add_duplicate_task(&self, post_id: &str, kind: TaskKind) -> Result<String> {
        self.orchestrator.add_duplicate_task(post_id, kind).await
    }

    pub async fn viewport_entered(&self, post_id: &str) {
        self.attention.viewport_entered(post_id).await;
    }

    pub async fn viewport_exited(&self, post_id: &str) {
        self.attention.viewport_exited(post_id).await;
    }

    pub async fn hover_started(&self, post_id: &str) {
        self.attention.hover_started(post_id).await;
    }

    pub async fn hover_ended(&self, post_id: &str) {
        self.attention.hover_ended(post_id).await;
    }

    pub async fn tab_hidden(&self) {
        self.attention.tab_hidden().await;
    }

    pub async fn tab_visible(&self) {
        self.attention.tab_visible().await;
    }

    /// Forward the observer's detached-element sweep to the attention timer.
    pub async fn prune_detached<F>(&self, is_detached: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.attention.prune_detached(is_detached).await;
    }

    /// Stop consuming completion events. In-flight adapter calls are left to
    /// finish or fail on their own; there is no task cancellation primitive.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn start_analysis(&self, post: PostData) -> Result<()> {
        let post_id = post.id.clone();
        let event_rx = self.orchestrator.initialize(&post).await?;
        self.db
            .update_post(
                &post_id,
                PostPatch {
                    state: Some(PostState::Analyzing),
                    ..Default::default()
                },
            )
            .await?;
        self.spawn_consumer(event_rx);
        Ok(())
    }

    fn spawn_consumer(&self, mut event_rx: tokio::sync::mpsc::UnboundedReceiver<TaskEvent>) {
        let reconciler = Arc::clone(&self.reconciler);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => reconciler.on_task_terminal(event).await,
                        None => break,
                    },
                }
            }
        });
    }
}
