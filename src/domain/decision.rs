//! Categorization outcome for a note draft.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a note goes and how it was decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDecision {
    /// Destination folder inside the vault
    pub folder: String,

    /// Normalized, deduplicated tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Titles of existing notes linked into the body
    #[serde(default)]
    pub links: Vec<String>,

    pub source: DecisionSource,

    #[serde(default)]
    pub needs_review: bool,
}

impl CategoryDecision {
    /// Route to the review folder
    pub fn review(default_folder: impl Into<String>, source: DecisionSource) -> Self {
        Self {
            folder: default_folder.into(),
            tags: Vec::new(),
            links: Vec::new(),
            source,
            needs_review: true,
        }
    }
}

/// How the folder was chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionSource {
    /// Keyword rules decided with `hits` distinct keyword matches
    RuleBased { rule: String, hits: usize },

    /// The classification model decided
    ModelBased { model: String, confidence: f32 },

    /// Nothing decided confidently
    Unresolved { reason: String },
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuleBased { rule, hits } => write!(f, "rule:{} ({} hits)", rule, hits),
            Self::ModelBased { model, confidence } => {
                write!(f, "model:{} ({:.2})", model, confidence)
            }
            Self::Unresolved { reason } => write!(f, "unresolved: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_is_tagged() {
        let source = DecisionSource::RuleBased {
            rule: "finance".into(),
            hits: 3,
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["type"], "rule_based");
        assert_eq!(json["hits"], 3);
        assert_eq!(source.to_string(), "rule:finance (3 hits)");
    }
}
