//! The retrieval agent's tool set.
//!
//! The set is closed: a call from the model either parses into one
//! [`AgentTool`] variant or is rejected with an error result.

use crate::tools::ToolSchema;
use crate::Tool;
use serde::Deserialize;
use serde_json::{json, Value};

/// List committed chapters with their summaries, characters and locations
#[derive(Debug, Clone, PartialEq, Eq, Tool, Deserialize)]
#[tool(name = "list_chapters")]
pub struct ListChapters {
    /// Only list chapters whose title, summary, keywords, characters, locations or plot threads mention this term
    pub filter: Option<String>,
}

/// Ask a focused question about one chapter's full text. Answers "NOT FOUND" when the chapter does not cover it
#[derive(Debug, Clone, PartialEq, Eq, Tool, Deserialize)]
#[tool(name = "query_chapter")]
pub struct QueryChapter {
    /// Chapter number
    #[tool(minimum = 1)]
    pub chapter: u32,
    /// The question to answer from the chapter text
    pub question: String,
}

/// Ask a question spanning consecutive chapters, for questions about how events developed over time
#[derive(Debug, Clone, PartialEq, Eq, Tool, Deserialize)]
#[tool(name = "query_chapter_range")]
pub struct QueryChapterRange {
    /// First chapter of the range
    #[tool(minimum = 1)]
    pub start: u32,
    /// Last chapter of the range, inclusive
    #[tool(minimum = 1)]
    pub end: u32,
    /// The question to answer from the chapters' text
    pub question: String,
}

/// List the story's lore entries (characters, places, items) for cross-reference
#[derive(Debug, Clone, PartialEq, Eq, Tool, Deserialize)]
#[tool(name = "list_entries")]
pub struct ListEntries {}

/// Finish gathering context and hand a short synthesis of the findings to the storyteller
#[derive(Debug, Clone, PartialEq, Eq, Tool, Deserialize)]
#[tool(name = "finish_retrieval")]
pub struct FinishRetrieval {
    /// What was found and why it matters for the next response
    pub summary: String,
}

/// A parsed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "name", content = "input", rename_all = "snake_case")]
pub enum AgentTool {
    ListChapters(ListChapters),
    QueryChapter(QueryChapter),
    QueryChapterRange(QueryChapterRange),
    ListEntries(ListEntries),
    FinishRetrieval(FinishRetrieval),
}

impl AgentTool {
    /// Parse a tool call by name and input.
    pub fn from_call(name: &str, input: &Value) -> Result<Self, String> {
        let input = if input.is_null() { json!({}) } else { input.clone() };
        serde_json::from_value(json!({ "name": name, "input": input }))
            .map_err(|e| format!("Invalid call to {name}: {e}"))
    }

    /// Definitions sent to the model.
    pub fn definitions() -> Vec<claude::Tool> {
        vec![
            ListChapters::as_tool(),
            QueryChapter::as_tool(),
            QueryChapterRange::as_tool(),
            ListEntries::as_tool(),
            FinishRetrieval::as_tool(),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentTool::ListChapters(_) => ListChapters::NAME,
            AgentTool::QueryChapter(_) => QueryChapter::NAME,
            AgentTool::QueryChapterRange(_) => QueryChapterRange::NAME,
            AgentTool::ListEntries(_) => ListEntries::NAME,
            AgentTool::FinishRetrieval(_) => FinishRetrieval::NAME,
        }
    }
}
