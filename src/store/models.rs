//! Post cache data model.
//!
//! One entry per observed post, mirroring the in-memory task state after
//! every transition plus the attention time accumulated by the timer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::Task;
use crate::taxonomy::{ClassificationResult, ClassificationSource};

/// Raw post content as handed to the engine by the platform observer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub id: String,
    pub platform: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PostState {
    Pending,
    Analyzing,
    Complete,
    Failed,
}

impl PostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostState::Pending => "pending",
            PostState::Analyzing => "analyzing",
            PostState::Complete => "complete",
            PostState::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PostState::Pending),
            "analyzing" => Some(PostState::Analyzing),
            "complete" => Some(PostState::Complete),
            "failed" => Some(PostState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMetadata {
    pub last_seen: DateTime<Utc>,
    pub time_spent_ms: u64,
    pub platform: String,
    pub screen_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCacheEntry {
    pub id: String,
    pub post_data: Option<PostData>,
    pub classification: Option<ClassificationResult>,
    pub classification_source: Option<ClassificationSource>,
    pub state: PostState,
    pub tasks: Vec<Task>,
    pub accumulated_text: String,
    pub metadata: PostMetadata,
}

/// Partial update for a post entry. `None` fields leave the stored column
/// untouched; metadata fields are merged the same way.
#[derive(Debug, Clone, Default)]
pub struct PostPatch {
    pub state: Option<PostState>,
    pub classification: Option<(ClassificationResult, ClassificationSource)>,
    pub tasks: Option<Vec<Task>>,
    pub accumulated_text: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub screen_active: Option<bool>,
}
