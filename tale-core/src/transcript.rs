//! Transcript turns and the read-only view memory has of them.
//!
//! The transcript is owned by the host application. Memory only reads turns
//! by position; it never appends or edits them. Which chapter a turn belongs
//! to is derived from the chapter index (see `ChapterIndex::chapter_of`)
//! rather than stored on the turn.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier for a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(Uuid);

impl TurnId {
    /// Create a new unique turn ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who wrote a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn label(&self) -> &'static str {
        match self {
            TurnRole::User => "User",
            TurnRole::Assistant => "Assistant",
        }
    }
}

/// One immutable transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: TurnRole,
    pub content: String,
    /// 1-based sequence position in the transcript.
    pub position: u64,
}

impl Turn {
    /// Render the turn as `[Turn N] Role: text` for prompts.
    pub fn render(&self) -> String {
        format!("[Turn {}] {}: {}", self.position, self.role.label(), self.content)
    }
}

/// Read access to the ordered transcript.
pub trait TranscriptStore: Send + Sync {
    /// Number of turns appended so far.
    fn len(&self) -> u64;

    /// Turns with positions in `start..=end`, in order. Positions past the
    /// end of the transcript are ignored.
    fn turns_between(&self, start: u64, end: u64) -> Vec<Turn>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A single turn by position.
    fn turn_at(&self, position: u64) -> Option<Turn> {
        self.turns_between(position, position).into_iter().next()
    }
}

/// A simple append-only transcript held in memory.
#[derive(Debug, Default)]
pub struct InMemoryTranscript {
    turns: RwLock<Vec<Turn>>,
}

impl InMemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn and return it.
    pub fn push(&self, role: TurnRole, content: impl Into<String>) -> Turn {
        let mut turns = self.turns.write();
        let turn = Turn {
            id: TurnId::new(),
            role,
            content: content.into(),
            position: turns.len() as u64 + 1,
        };
        turns.push(turn.clone());
        turn
    }

    pub fn push_user(&self, content: impl Into<String>) -> Turn {
        self.push(TurnRole::User, content)
    }

    pub fn push_assistant(&self, content: impl Into<String>) -> Turn {
        self.push(TurnRole::Assistant, content)
    }
}

impl TranscriptStore for InMemoryTranscript {
    fn len(&self) -> u64 {
        self.turns.read().len() as u64
    }

    fn turns_between(&self, start: u64, end: u64) -> Vec<Turn> {
        if start == 0 || end < start {
            return Vec::new();
        }
        let turns = self.turns.read();
        let from = (start - 1) as usize;
        let to = (end as usize).min(turns.len());
        if from >= to {
            return Vec::new();
        }
        turns[from..to].to_vec()
    }
}
