//! Classification reconciliation.
//!
//! Consumes per-post task completion events, persists task state, arbitrates
//! between local and authoritative classifications, and turns the winning
//! classification into a budget screening decision. Correct under any
//! interleaving of task completions.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};

use crate::adapters::{Classifier, ScreenControl};
use crate::attention::AttentionTimer;
use crate::settings::SettingsStore;
use crate::store::{Database, PostPatch, PostState};
use crate::tasks::{TaskEvent, TaskRegistry, TaskStatus};
use crate::taxonomy::{ClassificationResult, ClassificationSource, SCORE_NOISE_FLOOR};

pub struct Reconciler {
    db: Database,
    registry: Arc<TaskRegistry>,
    classifier: Arc<dyn Classifier>,
    screen: Arc<dyn ScreenControl>,
    settings: Arc<SettingsStore>,
    attention: AttentionTimer,
}

impl Reconciler {
    pub fn new(
        db: Database,
        registry: Arc<TaskRegistry>,
        classifier: Arc<dyn Classifier>,
        screen: Arc<dyn ScreenControl>,
        settings: Arc<SettingsStore>,
        attention: AttentionTimer,
    ) -> Self {
        Self {
            db,
            registry,
            classifier,
            screen,
            settings,
            attention,
        }
    }

    /// Entry point for the per-post completion channel consumer. Never
    /// escalates: a reconciliation failure degrades to a skipped update.
    pub async fn on_task_terminal(&self, event: TaskEvent) {
        let post_id = event.post_id.clone();
        if let Err(err) = self.handle(event).await {
            error!("reconciliation failed for post {post_id}: {err:#}");
        }
    }

    async fn handle(&self, event: TaskEvent) -> Result<()> {
        let post_id = event.post_id.as_str();
        let accumulated = self.registry.accumulated_text(post_id).await;
        let tasks = self.registry.tasks_snapshot(post_id).await;
        let all_terminal = self.registry.all_tasks_terminal(post_id).await;

        // Task state and accumulated text are mirrored unconditionally, even
        // for failed tasks, so partial results keep propagating.
        self.db
            .update_post(
                post_id,
                PostPatch {
                    tasks: Some(tasks),
                    accumulated_text: Some(accumulated.clone()),
                    last_seen: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        // A successful authoritative task always wins. Adopt the most recent
        // result and suppress local reclassification from here on.
        if event.task.kind.is_authoritative() && event.task.status == TaskStatus::Completed {
            if let Some((classification, completed_at)) =
                self.registry.most_recent_authoritative(post_id).await
            {
                self.registry.mark_remote_accepted(post_id).await;
                info!(
                    "post {post_id}: adopting authoritative classification from {completed_at}"
                );
                self.db
                    .update_post(
                        post_id,
                        PostPatch {
                            classification: Some((
                                classification.clone(),
                                ClassificationSource::Remote,
                            )),
                            state: all_terminal.then_some(PostState::Complete),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.evaluate_screening(post_id, &classification).await;
            }
            return Ok(());
        }

        // An accepted authoritative result must not be regressed by a weaker
        // local one.
        if self.registry.remote_accepted(post_id).await {
            if all_terminal {
                self.db
                    .update_post(
                        post_id,
                        PostPatch {
                            state: Some(PostState::Complete),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            return Ok(());
        }

        if !accumulated.is_empty() {
            let taxonomy = self.settings.taxonomy();
            match self.classifier.classify(&accumulated, &taxonomy).await {
                Ok(classification) => {
                    self.db
                        .update_post(
                            post_id,
                            PostPatch {
                                classification: Some((
                                    classification.clone(),
                                    ClassificationSource::Local,
                                )),
                                state: all_terminal.then_some(PostState::Complete),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.evaluate_screening(post_id, &classification).await;
                }
                Err(err) => {
                    // Prior classification and state stay as they were.
                    warn!("local classification failed for post {post_id}: {err:#}");
                }
            }
            return Ok(());
        }

        // Every task terminal, no classification, no text: nothing left that
        // could ever produce content for this post.
        if all_terminal {
            let has_classification = self
                .db
                .get_post(post_id)
                .await?
                .and_then(|entry| entry.classification)
                .is_some();
            let state = if has_classification {
                PostState::Complete
            } else {
                PostState::Failed
            };
            self.db
                .update_post(
                    post_id,
                    PostPatch {
                        state: Some(state),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(())
    }

    async fn evaluate_screening(&self, post_id: &str, classification: &ClassificationResult) {
        if let Err(err) = self.try_evaluate_screening(post_id, classification).await {
            warn!("screening evaluation failed for post {post_id}: {err:#}");
        }
    }

    /// Compare each significant score against its remaining daily budget.
    /// The noise-floor check comes first: a below-floor score never screens,
    /// however exhausted the budget is.
    async fn try_evaluate_screening(
        &self,
        post_id: &str,
        classification: &ClassificationResult,
    ) -> Result<()> {
        let budgets = self.settings.budgets();
        let day = Utc::now().format("%Y-%m-%d").to_string();

        let mut checks: Vec<(String, Option<String>, f64, f64)> = Vec::new();
        for (category, scores) in &classification.categories {
            if scores.total_score >= SCORE_NOISE_FLOOR {
                if let Some(budget_secs) = budgets.category_budget_secs(category) {
                    checks.push((category.clone(), None, scores.total_score, budget_secs));
                }
            }
            for (subcategory, score) in &scores.subcategories {
                if *score < SCORE_NOISE_FLOOR {
                    continue;
                }
                if let Some(budget_secs) =
                    budgets.subcategory_budget_secs(category, subcategory)
                {
                    checks.push((
                        category.clone(),
                        Some(subcategory.clone()),
                        *score,
                        budget_secs,
                    ));
                }
            }
        }

        let mut violation: Option<String> = None;
        for (category, subcategory, score, budget_secs) in checks {
            let consumed = self
                .db
                .consumed_seconds(&day, &category, subcategory.as_deref())
                .await?;
            if consumed + score > budget_secs {
                violation = Some(match subcategory {
                    Some(sub) => format!("{category}/{sub}"),
                    None => category,
                });
                break;
            }
        }

        let already_screened = self
            .db
            .get_post(post_id)
            .await?
            .map(|entry| entry.metadata.screen_active)
            .unwrap_or(false);

        match violation {
            Some(label) if !already_screened => {
                info!("post {post_id}: {label} over budget, screening");
                self.screen.show_screen(post_id).await?;
                self.db
                    .update_post(
                        post_id,
                        PostPatch {
                            screen_active: Some(true),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.attention.pause_for_screen(post_id).await;
            }
            Some(_) => {}
            None if already_screened => {
                info!("post {post_id}: back under budget, lifting screen");
                self.screen.hide_screen(post_id).await?;
                self.db
                    .update_post(
                        post_id,
                        PostPatch {
                            screen_active: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.attention.resume_from_screen(post_id).await;
            }
            None => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AnalysisPoll, RemoteAnalysis, TextExtractor};
    use crate::settings::{CategoryBudget, CategoryBudgets};
    use crate::store::PostData;
    use crate::tasks::{TaskEvent, TaskOrchestrator, TextSource};
    use crate::taxonomy::{CategoryScores, Taxonomy};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct FixedClassifier {
        result: ClassificationResult,
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(
            &self,
            _text: &str,
            _taxonomy: &Taxonomy,
        ) -> Result<ClassificationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("classifier offline");
            }
            Ok(self.result.clone())
        }
    }

    #[derive(Default)]
    struct RecordingScreen {
        shown: StdMutex<Vec<String>>,
        hidden: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ScreenControl for RecordingScreen {
        async fn show_screen(&self, post_id: &str) -> Result<()> {
            self.shown.lock().unwrap().push(post_id.to_string());
            Ok(())
        }

        async fn hide_screen(&self, post_id: &str) -> Result<()> {
            self.hidden.lock().unwrap().push(post_id.to_string());
            Ok(())
        }
    }

    /// Text extractor with a scripted delay and outcome.
    struct ScriptedText {
        source: TextSource,
        delay_ms: u64,
        text: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl TextExtractor for ScriptedText {
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

    /// Remote analysis that completes with a fixed result after a delay, or
    /// reports a service error immediately.
    struct ScriptedRemote {
        delay_ms: u64,
        result: Option<ClassificationResult>,
    }

    #[async_trait]
    impl RemoteAnalysis for ScriptedRemote {
        async fn poll(&self, _post: &PostData) -> Result<AnalysisPoll> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            match &self.result {
                Some(classification) => Ok(AnalysisPoll::Completed {
                    classification: classification.clone(),
                }),
                None => Ok(AnalysisPoll::Error {
                    message: "analysis unavailable".into(),
                }),
            }
        }
    }

    fn classification(category: &str, total: f64) -> ClassificationResult {
        let mut result = ClassificationResult::default();
        result.categories.insert(
            category.to_string(),
            CategoryScores {
                subcategories: HashMap::new(),
                total_score: total,
            },
        );
        result
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        registry: Arc<TaskRegistry>,
        screen: Arc<RecordingScreen>,
        classifier: Arc<FixedClassifier>,
        reconciler: Reconciler,
    }

    async fn fixture(local_result: ClassificationResult, classifier_fails: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("cache.sqlite3")).unwrap();
        let settings =
            Arc::new(SettingsStore::new(dir.path().join("settings.json")).unwrap());
        let mut budgets = CategoryBudgets::default();
        budgets.categories.insert(
            "education".into(),
            CategoryBudget {
                minutes_per_day: 60.0,
                subcategories: HashMap::new(),
            },
        );
        settings.update_budgets(budgets).unwrap();

        let registry = Arc::new(TaskRegistry::new());
        let screen = Arc::new(RecordingScreen::default());
        let classifier = Arc::new(FixedClassifier {
            result: local_result,
            calls: AtomicU32::new(0),
            fail: classifier_fails,
        });
        let attention = AttentionTimer::new(db.clone());
        let reconciler = Reconciler::new(
            db.clone(),
            Arc::clone(&registry),
            Arc::clone(&classifier) as Arc<dyn Classifier>,
            Arc::clone(&screen) as Arc<dyn ScreenControl>,
            settings,
            attention,
        );

        Fixture {
            _dir: dir,
            db,
            registry,
            screen,
            classifier,
            reconciler,
        }
    }

    fn sample_post(id: &str) -> PostData {
        PostData {
            id: id.to_string(),
            platform: "twitter".into(),
            author: None,
            text: Some("hello".into()),
            image_urls: vec![],
        }
    }

    /// Start a full task set against scripted adapters and feed every
    /// completion event through the reconciler, in arrival order.
    async fn run_post(
        fx: &Fixture,
        extractors: Vec<Arc<dyn TextExtractor>>,
        remote: Arc<dyn RemoteAnalysis>,
    ) {
        let orchestrator = TaskOrchestrator::new(
            Arc::clone(&fx.registry),
            extractors,
            remote,
            CancellationToken::new(),
        );
        let post = sample_post("p1");
        fx.db.create_pending_entry(&post).await.unwrap();
        let mut rx: mpsc::UnboundedReceiver<TaskEvent> =
            orchestrator.initialize(&post).await.unwrap();

        while !orchestrator.all_tasks_terminal("p1").await {
            let event = rx.recv().await.expect("event channel closed early");
            fx.reconciler.on_task_terminal(event).await;
        }
        while let Ok(event) = rx.try_recv() {
            fx.reconciler.on_task_terminal(event).await;
        }
    }

    fn text(source: TextSource, delay_ms: u64, text: &'static str) -> Arc<dyn TextExtractor> {
        Arc::new(ScriptedText {
            source,
            delay_ms,
            text,
            fail: false,
        })
    }

    fn failing_remote() -> Arc<dyn RemoteAnalysis> {
        Arc::new(ScriptedRemote {
            delay_ms: 1,
            result: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn local_result_does_not_overwrite_accepted_remote() {
        let fx = fixture(classification("news", 0.9), false).await;
        let remote_result = classification("sports", 0.8);

        // Remote completes at t=10ms, the text task at t=100ms.
        run_post(
            &fx,
            vec![text(TextSource::PostBody, 100, "some words")],
            Arc::new(ScriptedRemote {
                delay_ms: 10,
                result: Some(remote_result.clone()),
            }),
        )
        .await;

        let entry = fx.db.get_post("p1").await.unwrap().unwrap();
        assert_eq!(entry.classification.unwrap(), remote_result);
        assert_eq!(
            entry.classification_source,
            Some(ClassificationSource::Remote)
        );
        assert_eq!(entry.state, PostState::Complete);
        // The classifier never ran after acceptance.
        assert_eq!(fx.classifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(entry.accumulated_text, "some words");
    }

    #[tokio::test(start_paused = true)]
    async fn late_remote_supersedes_local_classification() {
        let fx = fixture(classification("news", 0.9), false).await;
        let remote_result = classification("sports", 0.8);

        // Text completes first, so a local classification lands; the remote
        // result must replace it when it arrives.
        run_post(
            &fx,
            vec![text(TextSource::PostBody, 10, "some words")],
            Arc::new(ScriptedRemote {
                delay_ms: 100,
                result: Some(remote_result.clone()),
            }),
        )
        .await;

        let entry = fx.db.get_post("p1").await.unwrap().unwrap();
        assert_eq!(entry.classification.unwrap(), remote_result);
        assert_eq!(
            entry.classification_source,
            Some(ClassificationSource::Remote)
        );
        assert_eq!(fx.classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn text_completion_triggers_local_classification() {
        let fx = fixture(classification("news", 0.9), false).await;
        run_post(
            &fx,
            vec![text(TextSource::PostBody, 10, "hello")],
            failing_remote(),
        )
        .await;

        let entry = fx.db.get_post("p1").await.unwrap().unwrap();
        assert_eq!(
            entry.classification_source,
            Some(ClassificationSource::Local)
        );
        assert!(fx.classifier.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(entry.accumulated_text, "hello");
        assert_eq!(entry.state, PostState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_failure_retains_prior_classification() {
        let fx = fixture(classification("news", 0.9), true).await;
        run_post(
            &fx,
            vec![text(TextSource::PostBody, 10, "hello")],
            failing_remote(),
        )
        .await;

        let entry = fx.db.get_post("p1").await.unwrap().unwrap();
        assert!(entry.classification.is_none());
        // The task list is still mirrored despite the classifier failure.
        assert_eq!(entry.accumulated_text, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn post_with_no_content_at_all_is_marked_failed() {
        let fx = fixture(classification("news", 0.9), false).await;
        run_post(
            &fx,
            vec![Arc::new(ScriptedText {
                source: TextSource::PostBody,
                delay_ms: 10,
                text: "",
                fail: true,
            })],
            failing_remote(),
        )
        .await;

        let entry = fx.db.get_post("p1").await.unwrap().unwrap();
        assert_eq!(entry.state, PostState::Failed);
        assert!(entry.classification.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn screening_fires_when_budget_would_be_exceeded() {
        // Education budget 3600s, consumed 3500s, new score 150 → screen.
        let fx = fixture(classification("education", 150.0), false).await;
        let day = Utc::now().format("%Y-%m-%d").to_string();
        fx.db
            .add_usage(&day, "education", None, 3500.0)
            .await
            .unwrap();

        run_post(
            &fx,
            vec![text(TextSource::PostBody, 10, "study")],
            failing_remote(),
        )
        .await;

        assert_eq!(fx.screen.shown.lock().unwrap().as_slice(), ["p1"]);
        let entry = fx.db.get_post("p1").await.unwrap().unwrap();
        assert!(entry.metadata.screen_active);
    }

    #[tokio::test(start_paused = true)]
    async fn sub_threshold_scores_never_screen() {
        // Same exhausted budget, but the score is classification noise.
        let fx = fixture(classification("education", 0.15), false).await;
        let day = Utc::now().format("%Y-%m-%d").to_string();
        fx.db
            .add_usage(&day, "education", None, 3500.0)
            .await
            .unwrap();

        run_post(
            &fx,
            vec![text(TextSource::PostBody, 10, "study")],
            failing_remote(),
        )
        .await;

        assert!(fx.screen.shown.lock().unwrap().is_empty());
        let entry = fx.db.get_post("p1").await.unwrap().unwrap();
        assert!(!entry.metadata.screen_active);
    }

    #[tokio::test(start_paused = true)]
    async fn screening_is_idempotent_across_reevaluations() {
        let fx = fixture(classification("education", 150.0), false).await;
        let day = Utc::now().format("%Y-%m-%d").to_string();
        fx.db
            .add_usage(&day, "education", None, 3500.0)
            .await
            .unwrap();

        // Two text tasks → two local classifications, both over budget.
        run_post(
            &fx,
            vec![
                text(TextSource::PostBody, 10, "study"),
                text(TextSource::ImageCaption, 50, "more study"),
            ],
            failing_remote(),
        )
        .await;

        assert_eq!(fx.screen.shown.lock().unwrap().len(), 1);
        // The screen stays up: the budget only ever gets more exhausted.
        assert!(fx.screen.hidden.lock().unwrap().is_empty());
    }
}
