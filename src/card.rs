//! Card model and kanban board file loading.
//!
//! A [`Card`] is the unit of work the engine processes end-to-end. Cards live
//! in a JSON board document; the engine treats the `column` field as the only
//! mutable one and leaves everything else untouched.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Card priority. Feeds the planner's complexity score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Weight contributed to the planner's complexity score.
    pub fn weight(&self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single unit of work.
///
/// `card_id` is immutable; `column` is the only field the engine mutates
/// during execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub card_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub story_points: u32,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Kanban position. Opaque to the engine except as a progress marker.
    #[serde(default = "default_column")]
    pub column: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_column() -> String {
    "backlog".to_string()
}

impl Card {
    pub fn new(card_id: &str, title: &str) -> Self {
        Self {
            card_id: card_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            priority: Priority::default(),
            story_points: 0,
            labels: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
            column: default_column(),
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_story_points(mut self, points: u32) -> Self {
        self.story_points = points;
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_acceptance_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }

    /// Title and description concatenated, the text the planner and the
    /// artifact store embed.
    pub fn task_text(&self) -> String {
        format!("{} {}", self.title, self.description)
    }
}

/// The kanban board document: a flat list of cards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Board {
    pub cards: Vec<Card>,
}

impl Board {
    /// Load a board from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read board file: {}", path.display()))?;
        let board: Board = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse board JSON: {}", path.display()))?;
        Ok(board)
    }

    /// Save the board back to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize board to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write board file: {}", path.display()))?;
        Ok(())
    }

    pub fn find_card(&self, card_id: &str) -> Option<&Card> {
        self.cards.iter().find(|c| c.card_id == card_id)
    }

    /// Move a card to a new column. Returns false if the card is unknown.
    pub fn set_column(&mut self, card_id: &str, column: &str) -> bool {
        match self.cards.iter_mut().find(|c| c.card_id == card_id) {
            Some(card) => {
                card.column = column.to_string();
                true
            }
            None => false,
        }
    }
}
