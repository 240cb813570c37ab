//! Keyword classification over an explicitly ordered category table.

use common::{ClassificationConfig, ClassifyText};
use serde::Serialize;
use std::collections::HashSet;

use crate::error::ConfigError;

/// Position of a category in its table. The catch-all sits after every
/// keyword category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CategoryId(pub usize);

#[derive(Debug, Clone)]
struct Category {
    name: String,
    /// Lowercased, in declaration order
    keywords: Vec<String>,
}

/// Ordered (category, keywords) list plus the catch-all. Order is priority.
#[derive(Debug, Clone)]
pub struct CategoryTable {
    categories: Vec<Category>,
    catch_all: String,
    text: ClassifyText,
}

impl CategoryTable {
    /// Build a table from ordered pairs. Fails on an empty table, a
    /// keyword-less category, duplicate names or an empty keyword.
    pub fn new<N, K>(entries: Vec<(N, Vec<K>)>, catch_all: &str, text: ClassifyText) -> Result<Self, ConfigError>
    where
        N: Into<String>,
        K: AsRef<str>,
    {
        let catch_all = catch_all.trim().to_string();
        if catch_all.is_empty() {
            return Err(ConfigError::MissingCatchAll);
        }

        let mut seen = HashSet::new();
        seen.insert(catch_all.clone());
        let mut categories = Vec::with_capacity(entries.len());

        for (name, keywords) in entries {
            let name: String = name.into();
            if name == catch_all {
                if keywords.is_empty() {
                    // An explicit catch-all entry is tolerated but never matched.
                    continue;
                }
                return Err(ConfigError::CatchAllHasKeywords(name));
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateCategory(name));
            }
            if keywords.is_empty() {
                return Err(ConfigError::NoKeywords(name));
            }
            let mut lowered = Vec::with_capacity(keywords.len());
            for kw in &keywords {
                let kw = kw.as_ref().trim();
                if kw.is_empty() {
                    return Err(ConfigError::EmptyKeyword(name));
                }
                lowered.push(kw.to_lowercase());
            }
            categories.push(Category { name, keywords: lowered });
        }

        if categories.is_empty() {
            return Err(ConfigError::EmptyCategoryTable);
        }

        Ok(Self { categories, catch_all, text })
    }

    pub fn from_config(cfg: &ClassificationConfig) -> Result<Self, ConfigError> {
        let entries = cfg
            .categories
            .iter()
            .map(|c| (c.name.clone(), c.keywords.clone()))
            .collect();
        Self::new(entries, &cfg.catch_all, cfg.text)
    }

    pub fn catch_all_id(&self) -> CategoryId {
        CategoryId(self.categories.len())
    }

    pub fn name(&self, id: CategoryId) -> &str {
        self.categories
            .get(id.0)
            .map(|c| c.name.as_str())
            .unwrap_or(&self.catch_all)
    }

    pub fn id_of(&self, name: &str) -> Option<CategoryId> {
        if name == self.catch_all {
            return Some(self.catch_all_id());
        }
        self.categories
            .iter()
            .position(|c| c.name == name)
            .map(CategoryId)
    }

    /// All ids in priority order, catch-all last.
    pub fn ids(&self) -> impl Iterator<Item = CategoryId> {
        (0..=self.categories.len()).map(CategoryId)
    }

    /// Assemble classifier input according to the table's text policy.
    pub fn classifier_input(&self, title: &str, body: Option<&str>) -> String {
        match (self.text, body) {
            (ClassifyText::TitleAndBody, Some(body)) => format!("{}\n{}", title, body),
            _ => title.to_string(),
        }
    }
}

/// First category (in table order) with a keyword occurring in `text`,
/// case-insensitively; the catch-all when none matches.
pub fn classify(text: &str, table: &CategoryTable) -> CategoryId {
    let haystack = text.to_lowercase();
    table
        .categories
        .iter()
        .position(|c| c.keywords.iter().any(|kw| haystack.contains(kw.as_str())))
        .map(CategoryId)
        .unwrap_or_else(|| table.catch_all_id())
}
