//! Content taxonomy and classification scores.
//!
//! A classification maps category names to per-subcategory scores. Scores are
//! either model confidences (0..1) or accumulated attention seconds reported
//! by the remote analysis service; the screening logic treats them uniformly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Scores below this floor are treated as classification noise: they are
/// never screened against a budget and never credited to the usage ledger.
pub const SCORE_NOISE_FLOOR: f64 = 0.2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyCategory {
    pub name: String,
    pub subcategories: Vec<String>,
}

/// The category tree handed to classification adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Taxonomy {
    pub categories: Vec<TaxonomyCategory>,
}

impl Taxonomy {
    /// Default taxonomy used when the settings file does not provide one.
    pub fn standard() -> Self {
        fn category(name: &str, subs: &[&str]) -> TaxonomyCategory {
            TaxonomyCategory {
                name: name.to_string(),
                subcategories: subs.iter().map(|s| s.to_string()).collect(),
            }
        }

        Self {
            categories: vec![
                category("entertainment", &["memes", "celebrity", "video", "gaming"]),
                category("news", &["breaking", "world", "local"]),
                category("education", &["tutorial", "science", "history"]),
                category("shopping", &["ads", "deals", "reviews"]),
                category("sports", &["scores", "highlights", "commentary"]),
                category("politics", &["elections", "policy", "commentary"]),
            ],
        }
    }

}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryScores {
    #[serde(default)]
    pub subcategories: HashMap<String, f64>,
    pub total_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    #[serde(default)]
    pub categories: HashMap<String, CategoryScores>,
}

impl ClassificationResult {
    pub fn total_attention_score(&self) -> f64 {
        self.categories.values().map(|c| c.total_score).sum()
    }

    /// Category names scoring at or above `floor`, used when crediting
    /// attention time to the daily usage ledger.
    pub fn categories_at_or_above(&self, floor: f64) -> Vec<&str> {
        self.categories
            .iter()
            .filter(|(_, scores)| scores.total_score >= floor)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Where a stored classification came from. Remote results supersede local
/// ones and suppress later local reclassification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ClassificationSource {
    Local,
    Remote,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationSource::Local => "local",
            ClassificationSource::Remote => "remote",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "local" => Some(ClassificationSource::Local),
            "remote" => Some(ClassificationSource::Remote),
            _ => None,
        }
    }
}
