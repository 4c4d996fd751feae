//! Chapter records.

use crate::error::IndexError;
use crate::transcript::{Turn, TurnId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 1-based, contiguous chapter number.
pub type ChapterNumber = u32;

/// Unique identifier for a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterId(Uuid);

impl ChapterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChapterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured metadata extracted from a chapter summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMetadata {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub plot_threads: Vec<String>,
    /// One line describing the emotional tone.
    #[serde(default)]
    pub emotional_tone: String,
}

/// An immutable, committed segment of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub number: ChapterNumber,
    pub title: String,
    pub start_turn: TurnId,
    pub end_turn: TurnId,
    /// Transcript position of the first member turn.
    pub start_position: u64,
    /// Transcript position of the last member turn.
    pub end_position: u64,
    pub turn_count: u64,
    /// Generated 2-4 paragraph summary.
    pub summary: String,
    /// Full rendered text of the member turns, kept for queries.
    pub source_text: String,
    pub created_at: DateTime<Utc>,
    pub metadata: ChapterMetadata,
}

impl Chapter {
    /// Build a chapter covering `turns`, which must be non-empty and ordered.
    pub fn from_turns(
        number: ChapterNumber,
        title: impl Into<String>,
        turns: &[Turn],
        summary: impl Into<String>,
        metadata: ChapterMetadata,
    ) -> Result<Self, IndexError> {
        let (Some(first), Some(last)) = (turns.first(), turns.last()) else {
            return Err(IndexError::OutOfSequence {
                reason: format!("chapter {number} has no turns"),
            });
        };

        Ok(Self {
            id: ChapterId::new(),
            number,
            title: title.into(),
            start_turn: first.id,
            end_turn: last.id,
            start_position: first.position,
            end_position: last.position,
            turn_count: turns.len() as u64,
            summary: summary.into(),
            source_text: render_turns(turns),
            created_at: Utc::now(),
            metadata,
        })
    }

    /// Lightweight view used for listings and planning prompts.
    pub fn preview(&self) -> ChapterPreview {
        ChapterPreview {
            number: self.number,
            title: self.title.clone(),
            summary: self.summary.clone(),
            start_position: self.start_position,
            end_position: self.end_position,
            characters: self.metadata.characters.clone(),
            locations: self.metadata.locations.clone(),
        }
    }

    /// Whether the chapter covers the given transcript position.
    pub fn contains_position(&self, position: u64) -> bool {
        (self.start_position..=self.end_position).contains(&position)
    }

    /// Case-insensitive match against keywords, names and summary.
    pub fn matches(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return true;
        }
        let meta = &self.metadata;
        meta.keywords
            .iter()
            .chain(&meta.characters)
            .chain(&meta.locations)
            .chain(&meta.plot_threads)
            .any(|value| value.to_lowercase().contains(&term))
            || self.title.to_lowercase().contains(&term)
            || self.summary.to_lowercase().contains(&term)
    }
}

/// Summary view of a chapter; no source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterPreview {
    pub number: ChapterNumber,
    pub title: String,
    pub summary: String,
    pub start_position: u64,
    pub end_position: u64,
    pub characters: Vec<String>,
    pub locations: Vec<String>,
}

impl ChapterPreview {
    /// Render for inclusion in a planning prompt.
    pub fn render(&self) -> String {
        let mut out = format!(
            "### Chapter {}: {} (turns {}-{})\n{}\n",
            self.number, self.title, self.start_position, self.end_position, self.summary
        );
        if !self.characters.is_empty() {
            out.push_str(&format!("Characters: {}\n", self.characters.join(", ")));
        }
        if !self.locations.is_empty() {
            out.push_str(&format!("Locations: {}\n", self.locations.join(", ")));
        }
        out
    }
}

/// Render turns one per paragraph.
pub fn render_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(Turn::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}
