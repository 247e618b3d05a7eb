use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use log::error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::adapters::{RemoteAnalysis, TextExtractor};
use crate::store::PostData;
use crate::taxonomy::ClassificationResult;

use super::runner;
use super::types::{Task, TaskEvent, TaskKind, TaskOutput, TaskStatus};

struct PostTasks {
    post: PostData,
    tasks: Vec<Task>,
    event_tx: mpsc::UnboundedSender<TaskEvent>,
    remote_accepted: bool,
}

/// Owns per-post task state, keyed by post id. Injected into the orchestrator
/// and reconciler so isolated engine instances never share ambient state.
#[derive(Default)]
pub struct TaskRegistry {
    posts: Mutex<HashMap<String, PostTasks>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, post_id: &str) -> bool {
        self.posts.lock().await.contains_key(post_id)
    }

    /// Space-joined results of completed text tasks, in task-list order.
    /// Completion order never affects the join.
    pub async fn accumulated_text(&self, post_id: &str) -> String {
        let posts = self.posts.lock().await;
        let Some(entry) = posts.get(post_id) else {
            return String::new();
        };
        entry
            .tasks
            .iter()
            .filter_map(Task::completed_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The completed authoritative result with the greatest `completed_at`.
    /// Older results are discarded even when they complete out of order.
    pub async fn most_recent_authoritative(
        &self,
        post_id: &str,
    ) -> Option<(ClassificationResult, DateTime<Utc>)> {
        let posts = self.posts.lock().await;
        let entry = posts.get(post_id)?;
        entry
            .tasks
            .iter()
            .filter(|task| {
                task.kind.is_authoritative() && task.status == TaskStatus::Completed
            })
            .filter_map(|task| {
                let completed_at = task.completed_at?;
                let classification = task
                    .output
                    .as_ref()
                    .and_then(TaskOutput::as_classification)?;
                Some((classification.clone(), completed_at))
            })
            .max_by_key(|(_, completed_at)| *completed_at)
    }

    pub async fn all_tasks_terminal(&self, post_id: &str) -> bool {
        let posts = self.posts.lock().await;
        match posts.get(post_id) {
            Some(entry) => entry.tasks.iter().all(|task| task.status.is_terminal()),
            None => false,
        }
    }

    pub async fn tasks_snapshot(&self, post_id: &str) -> Vec<Task> {
        let posts = self.posts.lock().await;
        posts
            .get(post_id)
            .map(|entry| entry.tasks.clone())
            .unwrap_or_default()
    }

    /// Once set, local reclassification for the post is suppressed for good
    /// (until a newer authoritative result lands, which re-runs acceptance).
    pub async fn mark_remote_accepted(&self, post_id: &str) {
        if let Some(entry) = self.posts.lock().await.get_mut(post_id) {
            entry.remote_accepted = true;
        }
    }

    pub async fn remote_accepted(&self, post_id: &str) -> bool {
        self.posts
            .lock()
            .await
            .get(post_id)
            .map(|entry| entry.remote_accepted)
            .unwrap_or(false)
    }

    pub async fn remove(&self, post_id: &str) {
        self.posts.lock().await.remove(post_id);
    }

    async fn mark_running(&self, post_id: &str, task_id: &str) {
        let mut posts = self.posts.lock().await;
        let Some(task) = posts
            .get_mut(post_id)
            .and_then(|entry| entry.tasks.iter_mut().find(|t| t.id == task_id))
        else {
            return;
        };
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
    }

    /// Record a terminal outcome and emit the completion event. Failures are
    /// isolated to the task itself; the event fires either way so partial
    /// results keep propagating.
    async fn record_terminal(&self, post_id: &str, task_id: &str, outcome: Result<TaskOutput>) {
        let mut posts = self.posts.lock().await;
        let Some(entry) = posts.get_mut(post_id) else {
            return;
        };
        let Some(task) = entry.tasks.iter_mut().find(|t| t.id == task_id) else {
            return;
        };

        match outcome {
            Ok(output) => {
                task.status = TaskStatus::Completed;
                task.output = Some(output);
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error = Some(format!("{err:#}"));
                error!("task {task_id} for post {post_id} failed: {err:#}");
            }
        }
        task.completed_at = Some(Utc::now());

        let event = TaskEvent {
            post_id: post_id.to_string(),
            task: task.clone(),
        };
        let _ = entry.event_tx.send(event);
    }
}

/// Spawns and tracks the evidence-gathering tasks for each post. Every task
/// runs independently; none waits on a sibling.
pub struct TaskOrchestrator {
    registry: Arc<TaskRegistry>,
    extractors: Vec<Arc<dyn TextExtractor>>,
    remote: Arc<dyn RemoteAnalysis>,
    cancel: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        extractors: Vec<Arc<dyn TextExtractor>>,
        remote: Arc<dyn RemoteAnalysis>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            extractors,
            remote,
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Create the initial task list (one authoritative analysis plus one text
    /// extraction per adapter) and start all of them immediately. Returns the
    /// receiving end of the post's completion channel.
    pub async fn initialize(
        &self,
        post: &PostData,
    ) -> Result<mpsc::UnboundedReceiver<TaskEvent>> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        {
            let mut posts = self.registry.posts.lock().await;
            if posts.contains_key(&post.id) {
                bail!("task set for post {} already initialized", post.id);
            }
            posts.insert(
                post.id.clone(),
                PostTasks {
                    post: post.clone(),
                    tasks: Vec::new(),
                    event_tx,
                    remote_accepted: false,
                },
            );
        }

        self.start_task(&post.id, TaskKind::RemoteAnalysis).await?;
        let sources: Vec<TaskKind> = self
            .extractors
            .iter()
            .map(|extractor| TaskKind::TextExtraction(extractor.source()))
            .collect();
        for kind in sources {
            self.start_task(&post.id, kind).await?;
        }

        Ok(event_rx)
    }

    /// Append one more task of `kind` without disturbing existing tasks.
    /// Duplicates are allowed by design; the most-recent-wins rule arbitrates
    /// between their results.
    pub async fn add_duplicate_task(&self, post_id: &str, kind: TaskKind) -> Result<String> {
        self.start_task(post_id, kind).await
    }

    pub async fn accumulated_text(&self, post_id: &str) -> String {
        self.registry.accumulated_text(post_id).await
    }

    pub async fn most_recent_authoritative(
        &self,
        post_id: &str,
    ) -> Option<(ClassificationResult, DateTime<Utc>)> {
        self.registry.most_recent_authoritative(post_id).await
    }

    pub async fn all_tasks_terminal(&self, post_id: &str) -> bool {
        self.registry.all_tasks_terminal(post_id).await
    }

    async fn start_task(&self, post_id: &str, kind: TaskKind) -> Result<String> {
        let task = Task::new(kind);
        let task_id = task.id.clone();

        let post = {
            let mut posts = self.registry.posts.lock().await;
            let entry = posts
                .get_mut(post_id)
                .ok_or_else(|| anyhow!("no task state for post {post_id}"))?;
            entry.tasks.push(task);
            entry.post.clone()
        };

        let registry = Arc::clone(&self.registry);
        let remote = Arc::clone(&self.remote);
        let extractor = match kind {
            TaskKind::TextExtraction(source) => self
                .extractors
                .iter()
                .find(|candidate| candidate.source() == source)
                .cloned(),
            TaskKind::RemoteAnalysis => None,
        };
        let cancel = self.cancel.clone();
        let spawned_id = task_id.clone();

        tokio::spawn(async move {
            registry.mark_running(&post.id, &spawned_id).await;

            let outcome: Result<TaskOutput> = match kind {
                TaskKind::RemoteAnalysis => {
                    runner::poll_remote(remote.as_ref(), &post, &cancel)
                        .await
                        .map(TaskOutput::Classification)
                }
                TaskKind::TextExtraction(source) => match extractor {
                    Some(extractor) => extractor.extract(&post).await.map(TaskOutput::Text),
                    None => Err(anyhow!("no extractor registered for {}", source.as_str())),
                },
            };

            registry.record_terminal(&post.id, &spawned_id, outcome).await;
        });

        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AnalysisPoll;
    use crate::tasks::TextSource;
    use async_trait::async_trait;
    use std::time::Duration;

    struct DelayedText {
        source: TextSource,
        delay_ms: u64,
        text: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl TextExtractor for DelayedText {
        fn source(&self) -> TextSource {
            self.source
        }

        async fn extract(&self, _post: &PostData) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                bail!("extractor blew up");
            }
            Ok(self.text.to_string())
        }
    }

    struct DelayedRemote {
        delay_ms: u64,
    }

    #[async_trait]
    impl RemoteAnalysis for DelayedRemote {
        async fn poll(&self, _post: &PostData) -> Result<AnalysisPoll> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(AnalysisPoll::Completed {
                classification: ClassificationResult::default(),
            })
        }
    }

    fn post() -> PostData {
        PostData {
            id: "p1".into(),
            platform: "twitter".into(),
            author: None,
            text: Some("hello".into()),
            image_urls: vec![],
        }
    }

    fn orchestrator(
        extractors: Vec<Arc<dyn TextExtractor>>,
        remote: Arc<dyn RemoteAnalysis>,
    ) -> TaskOrchestrator {
        TaskOrchestrator::new(
            Arc::new(TaskRegistry::new()),
            extractors,
            remote,
            CancellationToken::new(),
        )
    }

    async fn drain_until_terminal(
        orch: &TaskOrchestrator,
        rx: &mut mpsc::UnboundedReceiver<TaskEvent>,
        post_id: &str,
    ) {
        while !orch.all_tasks_terminal(post_id).await {
            rx.recv().await.expect("event channel closed early");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accumulated_text_is_task_list_order_not_completion_order() {
        // The later-listed extractor completes first.
        let orch = orchestrator(
            vec![
                Arc::new(DelayedText {
                    source: TextSource::PostBody,
                    delay_ms: 500,
                    text: "hello",
                    fail: false,
                }),
                Arc::new(DelayedText {
                    source: TextSource::ImageCaption,
                    delay_ms: 10,
                    text: "world",
                    fail: false,
                }),
            ],
            Arc::new(DelayedRemote { delay_ms: 50 }),
        );

        let mut rx = orch.initialize(&post()).await.unwrap();
        drain_until_terminal(&orch, &mut rx, "p1").await;

        assert_eq!(orch.accumulated_text("p1").await, "hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_extractor_leaves_siblings_untouched() {
        let orch = orchestrator(
            vec![
                Arc::new(DelayedText {
                    source: TextSource::PostBody,
                    delay_ms: 10,
                    text: "hello",
                    fail: false,
                }),
                Arc::new(DelayedText {
                    source: TextSource::ImageCaption,
                    delay_ms: 20,
                    text: "",
                    fail: true,
                }),
            ],
            Arc::new(DelayedRemote { delay_ms: 5 }),
        );

        let mut rx = orch.initialize(&post()).await.unwrap();

        let mut failed_events = 0;
        while !orch.all_tasks_terminal("p1").await {
            let event = rx.recv().await.unwrap();
            if event.task.status == TaskStatus::Failed {
                failed_events += 1;
                assert!(event.task.error.is_some());
            }
        }

        assert_eq!(failed_events, 1);
        assert_eq!(orch.accumulated_text("p1").await, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_remote_tasks_coexist_and_latest_completion_wins() {
        let orch = orchestrator(
            Vec::new(),
            Arc::new(DelayedRemote { delay_ms: 100 }),
        );

        let mut rx = orch.initialize(&post()).await.unwrap();
        orch.add_duplicate_task("p1", TaskKind::RemoteAnalysis)
            .await
            .unwrap();
        drain_until_terminal(&orch, &mut rx, "p1").await;

        let tasks = orch.registry().tasks_snapshot("p1").await;
        let remote_tasks: Vec<_> = tasks
            .iter()
            .filter(|t| t.kind.is_authoritative())
            .collect();
        assert_eq!(remote_tasks.len(), 2);
        assert!(remote_tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed));

        let latest = remote_tasks
            .iter()
            .filter_map(|t| t.completed_at)
            .max()
            .unwrap();
        let (_, winner_at) = orch.most_recent_authoritative("p1").await.unwrap();
        assert_eq!(winner_at, latest);
    }

    #[tokio::test(start_paused = true)]
    async fn double_initialize_is_rejected() {
        let orch = orchestrator(Vec::new(), Arc::new(DelayedRemote { delay_ms: 1 }));
        let _rx = orch.initialize(&post()).await.unwrap();
        assert!(orch.initialize(&post()).await.is_err());
    }

    #[tokio::test]
    async fn unknown_post_queries_are_empty() {
        let orch = orchestrator(Vec::new(), Arc::new(DelayedRemote { delay_ms: 1 }));
        assert_eq!(orch.accumulated_text("nope").await, "");
        assert!(orch.most_recent_authoritative("nope").await.is_none());
        assert!(!orch.all_tasks_terminal("nope").await);
    }
}
