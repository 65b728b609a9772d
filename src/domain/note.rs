//! Note drafts produced by Refinery.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Structured note body plus explicit action items
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteDraft {
    pub title: String,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub sections: Vec<NoteSection>,

    #[serde(default)]
    pub action_items: Vec<ActionItem>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Generation model that produced the draft
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_model: Option<String>,
}

impl NoteDraft {
    /// All prose in the draft, for keyword matching
    pub fn full_text(&self) -> String {
        let mut text = String::with_capacity(self.summary.len() + 256);
        text.push_str(&self.title);
        text.push('\n');
        text.push_str(&self.summary);
        for section in &self.sections {
            text.push('\n');
            text.push_str(&section.heading);
            text.push('\n');
            text.push_str(&section.body);
        }
        for item in &self.action_items {
            text.push('\n');
            text.push_str(&item.task);
        }
        text
    }
}

/// A titled topic section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSection {
    pub heading: String,

    #[serde(default)]
    pub body: String,
}

/// An actionable task found in the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub task: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,

    #[serde(default)]
    pub priority: Priority,

    /// Sentence the item was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ActionItem {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            due: None,
            priority: Priority::Normal,
            context: None,
        }
    }

    /// Obsidian Tasks line (without the list marker)
    pub fn to_task_line(&self) -> String {
        let mut line = format!("[ ] {}", self.task.trim());
        if let Some(due) = self.due {
            line.push_str(&format!(" 📅 {}", due.format("%Y-%m-%d")));
        }
        if let Some(marker) = self.priority.marker() {
            line.push(' ');
            line.push_str(marker);
        }
        line
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Obsidian Tasks priority marker
    pub fn marker(self) -> Option<&'static str> {
        match self {
            Self::High => Some("⏫"),
            Self::Normal => None,
            Self::Low => Some("🔽"),
        }
    }

    /// Lenient parse of model output ("high", "urgent", "p1", ...)
    pub fn parse_loose(s: &str) -> Priority {
        match s.trim().to_lowercase().as_str() {
            "high" | "urgent" | "critical" | "p1" | "1" => Self::High,
            "low" | "p3" | "3" | "someday" => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(s)
    }
}
