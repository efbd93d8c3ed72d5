use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tag with its confidence, as produced by document analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagModel {
    pub name: String,
    pub confidence: f32,
    pub category: Option<String>,
    pub description: Option<String>,
}

impl TagModel {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
            category: None,
            description: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Scoring breakdown for a ranked candidate document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentScore {
    pub file_path: String,
    pub total_score: f32,
    pub matching_tags: Vec<String>,
    pub tag_scores: HashMap<String, f32>,
}
