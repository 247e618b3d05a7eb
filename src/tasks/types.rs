use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::taxonomy::ClassificationResult;

/// Which text surface an extraction task reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TextSource {
    PostBody,
    ImageCaption,
    ScreenText,
}

impl TextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextSource::PostBody => "postBody",
            TextSource::ImageCaption => "imageCaption",
            TextSource::ScreenText => "screenText",
        }
    }
}

/// Task variants. Text extraction produces a fragment of the accumulated
/// text; remote analysis produces a full authoritative classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "source", rename_all = "camelCase")]
pub enum TaskKind {
    TextExtraction(TextSource),
    RemoteAnalysis,
}

impl TaskKind {
    pub fn is_authoritative(&self) -> bool {
        matches!(self, TaskKind::RemoteAnalysis)
    }

    pub fn produces_text(&self) -> bool {
        matches!(self, TaskKind::TextExtraction(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum TaskOutput {
    Text(String),
    Classification(ClassificationResult),
}

impl TaskOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskOutput::Text(text) => Some(text.as_str()),
            TaskOutput::Classification(_) => None,
        }
    }

    pub fn as_classification(&self) -> Option<&ClassificationResult> {
        match self {
            TaskOutput::Classification(result) => Some(result),
            TaskOutput::Text(_) => None,
        }
    }
}

/// One asynchronous unit of evidence-gathering for a post. Records are
/// append-only: duplicates of a kind may coexist and each reaches its own
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub output: Option<TaskOutput>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: TaskStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn completed_text(&self) -> Option<&str> {
        if self.status == TaskStatus::Completed && self.kind.produces_text() {
            self.output.as_ref().and_then(TaskOutput::as_text)
        } else {
            None
        }
    }
}

/// Emitted on the per-post completion channel once per task terminal event.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub post_id: String,
    pub task: Task,
}
