//! Answering questions against chapter text.
//!
//! Both operations are stateless; any number may run concurrently.

use crate::chapter::{Chapter, ChapterNumber};
use crate::config::ModelTier;
use crate::error::ModelCallError;
use crate::model::{CallPurpose, ModelClient, ModelRequest};
use crate::retry::{call_with_retry, non_empty_text, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const QUERY_SYSTEM: &str = include_str!("prompts/query_chapter.txt");

/// Rough characters-per-token ratio for budget estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Separator between chapter sections in a range prompt.
const SECTION_SEPARATOR: &str = "\n\n";

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// What a query was asked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTarget {
    Chapter(ChapterNumber),
    Range { start: ChapterNumber, end: ChapterNumber },
}

impl fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryTarget::Chapter(n) => write!(f, "chapter {n}"),
            QueryTarget::Range { start, end } => write!(f, "chapters {start}-{end}"),
        }
    }
}

/// Answer to one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub target: QueryTarget,
    pub question: String,
    pub answer: String,
}

impl QueryResult {
    pub fn new(target: QueryTarget, question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            target,
            question: question.into(),
            answer: answer.into(),
        }
    }

    /// Whether the answer is the explicit "not found" reply.
    pub fn is_not_found(&self) -> bool {
        let answer = self.answer.trim().trim_end_matches('.').to_lowercase();
        answer.starts_with("not found")
    }
}

/// Which chapters of a range fit the context budget.
#[derive(Debug)]
pub struct RangePlan<'a> {
    /// Included chapters, oldest first.
    pub included: Vec<&'a Chapter>,
    /// Chapters dropped to fit, oldest first.
    pub omitted: Vec<ChapterNumber>,
    /// Set when even the newest chapter alone exceeded the budget and had
    /// its opening cut.
    pub clipped: bool,
}

impl RangePlan<'_> {
    pub fn is_truncated(&self) -> bool {
        !self.omitted.is_empty() || self.clipped
    }

    /// Note appended to the answer when content was left out.
    pub fn truncation_note(&self) -> Option<String> {
        if !self.omitted.is_empty() {
            let omitted = self
                .omitted
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!(
                "[Note: chapters {omitted} were omitted to fit the context budget; this answer covers only the later chapters.]"
            ))
        } else if self.clipped {
            Some("[Note: the beginning of the chapter was cut to fit the context budget.]".to_string())
        } else {
            None
        }
    }
}

fn render_section(chapter: &Chapter) -> String {
    format!("## Chapter {}: {}\n{}", chapter.number, chapter.title, chapter.source_text)
}

/// Keep the most recent chapters that fit in `budget_chars`.
///
/// Walks from the newest chapter backwards and stops at the first chapter
/// that no longer fits, so the included chapters are always a contiguous
/// suffix of the range. The newest chapter is always included.
pub fn plan_range(chapters: &[Arc<Chapter>], budget_chars: usize) -> RangePlan<'_> {
    let mut used = 0;
    let mut keep_from = chapters.len();

    for (i, chapter) in chapters.iter().enumerate().rev() {
        let cost = render_section(chapter).chars().count() + SECTION_SEPARATOR.len();
        if used + cost > budget_chars {
            break;
        }
        used += cost;
        keep_from = i;
    }

    let clipped = keep_from == chapters.len() && !chapters.is_empty();
    if clipped {
        keep_from = chapters.len() - 1;
    }

    RangePlan {
        included: chapters[keep_from..].iter().map(|c| c.as_ref()).collect(),
        omitted: chapters[..keep_from].iter().map(|c| c.number).collect(),
        clipped,
    }
}

/// Keep the last `max_chars` characters of `text`.
fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}

/// Runs queries against chapters.
#[derive(Clone)]
pub struct QueryExecutor {
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
}

impl QueryExecutor {
    pub fn new(model: Arc<dyn ModelClient>, retry: RetryPolicy) -> Self {
        Self { model, retry }
    }

    /// Answer `question` from one chapter's full text.
    pub async fn query_chapter(
        &self,
        chapter: &Chapter,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, ModelCallError> {
        let prompt = format!(
            "{}\n\n## Question\n{question}",
            render_section(chapter)
        );
        let request = ModelRequest::new(CallPurpose::QueryChapter, ModelTier::Fast, QUERY_SYSTEM, prompt)
            .with_temperature(0.0);

        let answer = call_with_retry(self.model.as_ref(), &self.retry, &request, cancel, non_empty_text).await?;
        tracing::debug!(chapter = chapter.number, answer_len = answer.len(), "chapter query answered");
        Ok(QueryResult::new(QueryTarget::Chapter(chapter.number), question, answer))
    }

    /// Answer `question` from a run of consecutive chapters.
    ///
    /// When the chapters exceed `budget_tokens` the oldest are dropped first
    /// and the answer says which were left out.
    pub async fn query_range(
        &self,
        chapters: &[Arc<Chapter>],
        question: &str,
        budget_tokens: usize,
        cancel: &CancellationToken,
    ) -> Result<QueryResult, ModelCallError> {
        let (Some(first), Some(last)) = (chapters.first(), chapters.last()) else {
            return Err(ModelCallError::Malformed("empty chapter range".to_string()));
        };
        let target = QueryTarget::Range {
            start: first.number,
            end: last.number,
        };

        let budget_chars = budget_tokens.saturating_mul(CHARS_PER_TOKEN);
        let plan = plan_range(chapters, budget_chars);
        let mut sections: Vec<String> = plan.included.iter().map(|c| render_section(c)).collect();
        if plan.clipped {
            if let Some(section) = sections.last_mut() {
                *section = tail_chars(section, budget_chars).to_string();
            }
        }
        if plan.is_truncated() {
            tracing::info!(%target, omitted = ?plan.omitted, clipped = plan.clipped, "range query truncated to budget");
        }

        let mut prompt = format!("## Chapters {}-{}\n\n", first.number, last.number);
        if let Some(note) = plan.truncation_note() {
            prompt.push_str(&note);
            prompt.push_str(SECTION_SEPARATOR);
        }
        prompt.push_str(&sections.join(SECTION_SEPARATOR));
        prompt.push_str(&format!("\n\n## Question\n{question}"));

        let request = ModelRequest::new(CallPurpose::QueryRange, ModelTier::Fast, QUERY_SYSTEM, prompt)
            .with_temperature(0.0);
        let mut answer = call_with_retry(self.model.as_ref(), &self.retry, &request, cancel, non_empty_text).await?;

        if let Some(note) = plan.truncation_note() {
            answer.push_str(SECTION_SEPARATOR);
            answer.push_str(&note);
        }
        Ok(QueryResult::new(target, question, answer))
    }
}
