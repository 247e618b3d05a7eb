use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{fs, path::PathBuf, sync::RwLock};

use crate::taxonomy::Taxonomy;

/// Daily allotment for one category, in minutes. Subcategory allotments are
/// optional overrides keyed by subcategory name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBudget {
    pub minutes_per_day: f64,
    #[serde(default)]
    pub subcategories: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBudgets {
    #[serde(default)]
    pub categories: HashMap<String, CategoryBudget>,
}

impl CategoryBudgets {
    pub fn category_budget_secs(&self, category: &str) -> Option<f64> {
        self.categories
            .get(category)
            .map(|b| b.minutes_per_day * 60.0)
    }

    pub fn subcategory_budget_secs(&self, category: &str, subcategory: &str) -> Option<f64> {
        self.categories
            .get(category)
            .and_then(|b| b.subcategories.get(subcategory))
            .map(|minutes| minutes * 60.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserSettings {
    #[serde(default)]
    budgets: CategoryBudgets,
    #[serde(default = "Taxonomy::standard")]
    taxonomy: Taxonomy,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            budgets: CategoryBudgets::default(),
            taxonomy: Taxonomy::standard(),
        }
    }
}

/// JSON-file-backed settings. Budgets are read-only to the engine core; the
/// surrounding application mutates them through `update_budgets`.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn budgets(&self) -> CategoryBudgets {
        self.data.read().unwrap().budgets.clone()
    }

    pub fn taxonomy(&self) -> Taxonomy {
        self.data.read().unwrap().taxonomy.clone()
    }

    pub fn update_budgets(&self, budgets: CategoryBudgets) -> Result<()> {
        {
            let mut guard = self.data.write().unwrap();
            guard.budgets = budgets;
            self.persist(&guard)?;
        }
        Ok(())
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: UserSettings = serde_json::from_str(&contents)?;
        let mut guard = self.data.write().unwrap();
        *guard = data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        assert!(store.budgets().categories.is_empty());
        assert!(!store.taxonomy().categories.is_empty());
    }

    #[test]
    fn budgets_round_trip_and_convert_to_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();

        let mut budgets = CategoryBudgets::default();
        budgets.categories.insert(
            "education".into(),
            CategoryBudget {
                minutes_per_day: 60.0,
                subcategories: HashMap::from([("tutorial".into(), 15.0)]),
            },
        );
        store.update_budgets(budgets).unwrap();

        let reloaded = SettingsStore::new(path).unwrap();
        assert_eq!(
            reloaded.budgets().category_budget_secs("education"),
            Some(3600.0)
        );
        assert_eq!(
            reloaded
                .budgets()
                .subcategory_budget_secs("education", "tutorial"),
            Some(900.0)
        );
        assert_eq!(reloaded.budgets().category_budget_secs("sports"), None);
    }
}
