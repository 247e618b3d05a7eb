//! External collaborator seams.
//!
//! The engine treats extraction, classification and the remote analysis
//! service as opaque async adapters injected at construction. Implementations
//! live outside the core; tests and the demo binary provide stubs.

use anyhow::Result;
use async_trait::async_trait;

use crate::store::PostData;
use crate::tasks::TextSource;
use crate::taxonomy::{ClassificationResult, Taxonomy};

/// One step of the authoritative analysis poll protocol.
#[derive(Debug, Clone)]
pub enum AnalysisPoll {
    Completed { classification: ClassificationResult },
    Processing { retry_after_secs: u64 },
    Error { message: String },
}

/// High-quality remote analysis. A single call either yields the final
/// classification, a retry directive, or a service-side error.
#[async_trait]
pub trait RemoteAnalysis: Send + Sync {
    async fn poll(&self, post: &PostData) -> Result<AnalysisPoll>;
}

/// Cheap local classification over accumulated text. Errors surface to the
/// caller; the adapter never defaults silently.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, taxonomy: &Taxonomy) -> Result<ClassificationResult>;
}

/// Produces one text fragment for a post (body text, image caption, OCR).
#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn source(&self) -> TextSource;

    async fn extract(&self, post: &PostData) -> Result<String>;
}

/// UI surface for hiding a post behind a budget-violation overlay.
#[async_trait]
pub trait ScreenControl: Send + Sync {
    async fn show_screen(&self, post_id: &str) -> Result<()>;

    async fn hide_screen(&self, post_id: &str) -> Result<()>;
}

pub const IMAGE_TEXT_PLACEHOLDER: &str = "[image unavailable]";

/// Join per-image extraction outcomes, substituting a placeholder for each
/// failed image so one bad image never sinks the whole fragment.
pub fn join_image_texts(parts: impl IntoIterator<Item = Result<String>>) -> String {
    parts
        .into_iter()
        .map(|part| part.unwrap_or_else(|_| IMAGE_TEXT_PLACEHOLDER.to_string()))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
