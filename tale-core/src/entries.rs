//! Read-only access to the host's lore entries (characters, places, items).
//!
//! The engine never edits entries; the retrieval agent only lists them.

use serde::{Deserialize, Serialize};

/// One lore entry as shown to the retrieval agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub name: String,
    /// Entry category, e.g. "character" or "location".
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

impl EntrySummary {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
        }
    }

    pub fn render(&self) -> String {
        if self.description.is_empty() {
            format!("- {} ({})", self.name, self.kind)
        } else {
            format!("- {} ({}): {}", self.name, self.kind, self.description)
        }
    }
}

/// Source of lore entries.
pub trait EntrySource: Send + Sync {
    fn list_entries(&self) -> Vec<EntrySummary>;
}

/// A story with no lore entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEntries;

impl EntrySource for NoEntries {
    fn list_entries(&self) -> Vec<EntrySummary> {
        Vec::new()
    }
}

/// Render entries for a tool result.
pub fn render_entries(entries: &[EntrySummary]) -> String {
    if entries.is_empty() {
        return "No entries.".to_string();
    }
    entries
        .iter()
        .map(EntrySummary::render)
        .collect::<Vec<_>>()
        .join("\n")
}
