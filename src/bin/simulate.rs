//! Feed a handful of synthetic posts through the engine with stub adapters.
//!
//! Run with `RUST_LOG=info cargo run --bin simulate`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use rand::Rng;

use scrollguard::adapters::{
    join_image_texts, AnalysisPoll, Classifier, RemoteAnalysis, ScreenControl, TextExtractor,
};
use scrollguard::settings::{CategoryBudget, CategoryBudgets, SettingsStore};
use scrollguard::store::{Database, PostData};
use scrollguard::tasks::TextSource;
use scrollguard::taxonomy::{CategoryScores, ClassificationResult, Taxonomy};
use scrollguard::{Engine, EngineAdapters};

struct BodyExtractor;

#[async_trait]
impl TextExtractor for BodyExtractor {
    fn source(&self) -> TextSource {
        TextSource::PostBody
    }

    async fn extract(&self, post: &PostData) -> Result<String> {
        Ok(post.text.clone().unwrap_or_default())
    }
}

struct CaptionExtractor;

#[async_trait]
impl TextExtractor for CaptionExtractor {
    fn source(&self) -> TextSource {
        TextSource::ImageCaption
    }

    async fn extract(&self, post: &PostData) -> Result<String> {
        let delay = rand::thread_rng().gen_range(200..800);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let captions = post
            .image_urls
            .iter()
            .map(|url| Ok(format!("a picture from {url}")))
            .collect::<Vec<_>>();
        Ok(join_image_texts(captions))
    }
}

/// Counts taxonomy keyword hits in the accumulated text.
struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str, taxonomy: &Taxonomy) -> Result<ClassificationResult> {
        let lowered = text.to_lowercase();
        let mut result = ClassificationResult::default();

        for category in &taxonomy.categories {
            let mut subcategories = HashMap::new();
            let mut total = 0.0;
            for subcategory in &category.subcategories {
                let score = if lowered.contains(subcategory.as_str()) {
                    0.8
                } else {
                    0.0
                };
                if score > 0.0 {
                    subcategories.insert(subcategory.clone(), score);
                    total += score;
                }
            }
            if lowered.contains(category.name.as_str()) {
                total += 1.0;
            }
            if total > 0.0 {
                result.categories.insert(
                    category.name.clone(),
                    CategoryScores {
                        subcategories,
                        total_score: total,
                    },
                );
            }
        }

        Ok(result)
    }
}

/// Completes after a couple of server-directed retries.
struct SlowRemote {
    polls: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl RemoteAnalysis for SlowRemote {
    async fn poll(&self, post: &PostData) -> Result<AnalysisPoll> {
        use std::sync::atomic::Ordering;

        if self.polls.fetch_add(1, Ordering::SeqCst) < 2 {
            return Ok(AnalysisPoll::Processing {
                retry_after_secs: 1,
            });
        }

        let mut result = ClassificationResult::default();
        let category = if post.id.ends_with('1') || post.id.ends_with('3') {
            "entertainment"
        } else {
            "news"
        };
        result.categories.insert(
            category.to_string(),
            CategoryScores {
                subcategories: HashMap::new(),
                total_score: 90.0,
            },
        );
        Ok(AnalysisPoll::Completed {
            classification: result,
        })
    }
}

struct LogScreen;

#[async_trait]
impl ScreenControl for LogScreen {
    async fn show_screen(&self, post_id: &str) -> Result<()> {
        info!(">>> screen shown for {post_id}");
        Ok(())
    }

    async fn hide_screen(&self, post_id: &str) -> Result<()> {
        info!(">>> screen hidden for {post_id}");
        Ok(())
    }
}

fn sample_posts() -> Vec<PostData> {
    vec![
        PostData {
            id: "demo-1".into(),
            platform: "twitter".into(),
            author: Some("meme_lord".into()),
            text: Some("top ten gaming memes of the week, pure entertainment".into()),
            image_urls: vec!["https://img.example/meme.png".into()],
        },
        PostData {
            id: "demo-2".into(),
            platform: "twitter".into(),
            author: Some("daily_digest".into()),
            text: Some("breaking news from around the world".into()),
            image_urls: vec![],
        },
        PostData {
            id: "demo-3".into(),
            platform: "reddit".into(),
            author: None,
            text: Some("history tutorial: the science of bridges".into()),
            image_urls: vec!["https://img.example/bridge.jpg".into()],
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let data_dir = std::env::temp_dir().join("scrollguard-demo");
    std::fs::create_dir_all(&data_dir)?;
    let db = Database::new(data_dir.join("cache.sqlite3"))?;

    let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
    let mut budgets = CategoryBudgets::default();
    // A tiny entertainment budget so screening actually fires in the demo.
    budgets.categories.insert(
        "entertainment".into(),
        CategoryBudget {
            minutes_per_day: 1.0,
            subcategories: HashMap::new(),
        },
    );
    budgets.categories.insert(
        "news".into(),
        CategoryBudget {
            minutes_per_day: 120.0,
            subcategories: HashMap::new(),
        },
    );
    settings.update_budgets(budgets)?;

    let engine = Engine::new(
        db.clone(),
        settings,
        EngineAdapters {
            extractors: vec![Arc::new(BodyExtractor), Arc::new(CaptionExtractor)],
            remote: Arc::new(SlowRemote {
                polls: std::sync::atomic::AtomicU32::new(0),
            }),
            classifier: Arc::new(KeywordClassifier),
            screen: Arc::new(LogScreen),
        },
    );

    let recovered = engine.recover_incomplete().await?;
    if recovered > 0 {
        info!("recovered {recovered} posts from a previous run");
    }

    for post in sample_posts() {
        info!("observing post {}", post.id);
        engine.observe_post(post.clone()).await?;
        engine.viewport_entered(&post.id).await;
    }

    // Scroll around a bit.
    tokio::time::sleep(Duration::from_secs(2)).await;
    engine.viewport_exited("demo-1").await;
    engine.hover_started("demo-2").await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.hover_ended("demo-2").await;

    info!("tab hidden");
    engine.tab_hidden().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("tab visible again");
    engine.tab_visible().await;

    // Let the slow analysis tasks drain.
    tokio::time::sleep(Duration::from_secs(6)).await;
    for post in sample_posts() {
        engine.viewport_exited(&post.id).await;
    }

    for post in sample_posts() {
        if let Some(entry) = db.get_post(&post.id).await? {
            info!(
                "post {}: state={:?} source={:?} time_spent={}ms screened={} text={:?}",
                entry.id,
                entry.state,
                entry.classification_source,
                entry.metadata.time_spent_ms,
                entry.metadata.screen_active,
                entry.accumulated_text,
            );
        }
    }

    engine.shutdown();
    Ok(())
}
