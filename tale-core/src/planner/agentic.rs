//! Tool-calling retrieval loop.
//!
//! Each iteration sends the running conversation to the model. Tool calls
//! in one iteration run concurrently; iterations run one after another. The
//! loop ends when the model calls `finish_retrieval`, answers without
//! calling a tool, or reaches the iteration cap. At the cap it returns what
//! it has gathered, marked partial.

use super::tools::{
    AgentTool, FinishRetrieval, ListChapters, QueryChapter, QueryChapterRange,
};
use super::{PlanInputs, RetrievedContext};
use crate::chapter::ChapterPreview;
use crate::config::{ModelTier, PlannerKind};
use crate::entries::{render_entries, EntrySource};
use crate::error::{MemoryError, ModelCallError};
use crate::model::{CallPurpose, ModelClient, ModelRequest};
use crate::query::{QueryExecutor, QueryResult};
use crate::retry::{call_with_retry, RetryPolicy};
use claude::{ContentBlock, Message, ToolResult, ToolUse};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const AGENT_SYSTEM: &str = include_str!("../prompts/agent.txt");

/// Outcome of executing one tool call.
struct ToolOutcome {
    result: ToolResult,
    query: Option<QueryResult>,
}

impl ToolOutcome {
    fn text(content: impl Into<String>) -> Self {
        Self {
            result: ToolResult::success(content),
            query: None,
        }
    }

    fn error(content: impl Into<String>) -> Self {
        Self {
            result: ToolResult::error(content),
            query: None,
        }
    }

    fn answered(query: QueryResult) -> Self {
        Self {
            result: ToolResult::success(query.answer.clone()),
            query: Some(query),
        }
    }
}

/// Iterative, tool-driven strategy.
pub struct AgenticPlanner {
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    executor: QueryExecutor,
    entries: Arc<dyn EntrySource>,
}

impl AgenticPlanner {
    pub fn new(
        model: Arc<dyn ModelClient>,
        retry: RetryPolicy,
        executor: QueryExecutor,
        entries: Arc<dyn EntrySource>,
    ) -> Self {
        Self {
            model,
            retry,
            executor,
            entries,
        }
    }

    /// Run the loop for one user turn.
    ///
    /// A failed iteration call yields `Ok(None)`. A failed tool call is
    /// reported back to the model and the loop continues.
    pub async fn retrieve(
        &self,
        inputs: PlanInputs<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<RetrievedContext>, MemoryError> {
        let max_iterations = inputs.config.max_agent_iterations;
        let mut messages = vec![Message::user(format!(
            "## Player Message\n{}\n\nThe archive holds {} chapters. Gather the context the storyteller needs, then call finish_retrieval.",
            inputs.user_turn,
            inputs.index.count()
        ))];
        let mut results = Vec::new();

        for iteration in 1..=max_iterations {
            let request = ModelRequest::conversation(
                CallPurpose::AgentIteration,
                ModelTier::Fast,
                AGENT_SYSTEM,
                messages.clone(),
            )
            .with_tools(AgentTool::definitions());

            let response = match call_with_retry(
                self.model.as_ref(),
                &self.retry,
                &request,
                cancel,
                |response| Ok(response.clone()),
            )
            .await
            {
                Ok(response) => response,
                Err(ModelCallError::Cancelled) => return Err(MemoryError::Cancelled),
                Err(err) => {
                    tracing::warn!(iteration, error = %err, "agent iteration failed, continuing without context");
                    return Ok(None);
                }
            };

            let calls = response.tool_uses();
            if calls.is_empty() {
                // Answering in prose counts as finishing.
                let text = response.text();
                let summary = Some(text.trim().to_string()).filter(|s| !s.is_empty());
                tracing::info!(iteration, results = results.len(), "agent finished without tool call");
                return Ok(Some(finished(results, summary, false)));
            }

            let parsed: Vec<(ToolUse, Result<AgentTool, String>)> = calls
                .into_iter()
                .map(|call| {
                    let tool = AgentTool::from_call(&call.name, &call.input);
                    (call, tool)
                })
                .collect();

            let finish = parsed.iter().find_map(|(_, tool)| match tool {
                Ok(AgentTool::FinishRetrieval(FinishRetrieval { summary })) => Some(summary.clone()),
                _ => None,
            });

            let outcomes = join_all(
                parsed
                    .iter()
                    .map(|(_, tool)| self.execute(tool, inputs, cancel)),
            )
            .await;

            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }

            let mut blocks = Vec::with_capacity(outcomes.len());
            for ((call, _), outcome) in parsed.iter().zip(outcomes) {
                results.extend(outcome.query);
                blocks.push(ContentBlock::tool_result(&call.id, outcome.result));
            }
            tracing::debug!(iteration, calls = blocks.len(), results = results.len(), "agent iteration complete");

            if let Some(summary) = finish {
                tracing::info!(iteration, results = results.len(), "agent finished retrieval");
                return Ok(Some(finished(results, Some(summary), false)));
            }

            messages.push(response.to_message());
            messages.push(Message::tool_results(blocks));
        }

        tracing::info!(
            iterations = max_iterations,
            results = results.len(),
            "agent reached iteration cap, returning partial context"
        );
        Ok(Some(finished(results, None, true)))
    }

    async fn execute(
        &self,
        tool: &Result<AgentTool, String>,
        inputs: PlanInputs<'_>,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let tool = match tool {
            Ok(tool) => tool,
            Err(reason) => return ToolOutcome::error(reason.clone()),
        };

        match tool {
            AgentTool::ListChapters(ListChapters { filter }) => {
                let previews = match filter.as_deref().map(str::trim) {
                    Some(term) if !term.is_empty() => inputs.index.search(term),
                    _ => inputs.index.list(),
                };
                if previews.is_empty() {
                    ToolOutcome::text("No chapters match.")
                } else {
                    ToolOutcome::text(render_previews(&previews))
                }
            }
            AgentTool::QueryChapter(QueryChapter { chapter, question }) => {
                let chapter = match inputs.index.get(*chapter) {
                    Ok(chapter) => chapter,
                    Err(err) => return ToolOutcome::error(err.to_string()),
                };
                match self.executor.query_chapter(&chapter, question, cancel).await {
                    Ok(result) => ToolOutcome::answered(result),
                    Err(err) => query_failed(err),
                }
            }
            AgentTool::QueryChapterRange(QueryChapterRange { start, end, question }) => {
                let max = inputs.config.max_chapters_per_range;
                if *start == 0 {
                    return ToolOutcome::error("Chapter numbers start at 1");
                }
                let width = u64::from(*end).saturating_sub(u64::from(*start)) + 1;
                if end >= start && width > u64::from(max) {
                    return ToolOutcome::error(format!(
                        "Range {start}-{end} spans more than {max} chapters; split it into smaller ranges"
                    ));
                }
                let chapters = match inputs.index.get_range(*start, *end) {
                    Ok(chapters) => chapters,
                    Err(err) => return ToolOutcome::error(err.to_string()),
                };
                match self
                    .executor
                    .query_range(&chapters, question, inputs.config.range_budget_tokens, cancel)
                    .await
                {
                    Ok(result) => ToolOutcome::answered(result),
                    Err(err) => query_failed(err),
                }
            }
            AgentTool::ListEntries(_) => ToolOutcome::text(render_entries(&self.entries.list_entries())),
            AgentTool::FinishRetrieval(_) => ToolOutcome::text("Retrieval finished."),
        }
    }
}

fn finished(results: Vec<QueryResult>, summary: Option<String>, partial: bool) -> RetrievedContext {
    let mut context = RetrievedContext::new(PlannerKind::Agentic, results);
    context.summary = summary;
    context.partial = partial;
    context
}

fn query_failed(err: ModelCallError) -> ToolOutcome {
    tracing::warn!(error = %err, "agent query failed");
    ToolOutcome::error(format!("Query failed: {err}"))
}

fn render_previews(previews: &[ChapterPreview]) -> String {
    previews
        .iter()
        .map(ChapterPreview::render)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::{Chapter, ChapterMetadata};
    use crate::config::RetrievalConfig;
    use crate::entries::{EntrySummary, NoEntries};
    use crate::index::ChapterIndex;
    use crate::query::QueryTarget;
    use crate::testing::{number_after, transcript_with, MockModel, MockReply, StaticEntries};
    use crate::transcript::TranscriptStore;
    use serde_json::json;

    fn index_with(count: u32) -> ChapterIndex {
        let transcript = transcript_with(count as u64 * 2);
        let mut index = ChapterIndex::new();
        for n in 1..=count {
            let start = (n as u64 - 1) * 2 + 1;
            let turns = transcript.turns_between(start, start + 1);
            let metadata = ChapterMetadata {
                characters: vec![if n % 2 == 0 { "Tobin" } else { "Mira" }.to_string()],
                ..ChapterMetadata::default()
            };
            index
                .append(Chapter::from_turns(n, format!("Part {n}"), &turns, "Summary.", metadata).unwrap())
                .unwrap();
        }
        index
    }

    fn planner(model: Arc<MockModel>, entries: Arc<dyn EntrySource>) -> AgenticPlanner {
        let executor = QueryExecutor::new(model.clone(), RetryPolicy::immediate());
        AgenticPlanner::new(model, RetryPolicy::immediate(), executor, entries)
    }

    /// Scripted agent: replies with `script[i]` on iteration `i`, answering
    /// chapter queries with the chapter number.
    fn scripted_agent(script: Vec<MockReply>) -> MockModel {
        let script = parking_lot::Mutex::new(script.into_iter());
        MockModel::new(move |request| match request.purpose {
            CallPurpose::AgentIteration => script
                .lock()
                .next()
                .unwrap_or_else(|| MockReply::text("Done.")),
            CallPurpose::QueryChapter => {
                let chapter = number_after(&request.prompt(), "Chapter").unwrap_or(0);
                MockReply::text(format!("Answer from chapter {chapter}."))
            }
            _ => MockReply::text("Range answer."),
        })
    }

    fn run_inputs<'a>(index: &'a ChapterIndex, config: &'a RetrievalConfig) -> PlanInputs<'a> {
        PlanInputs {
            user_turn: "Do I still owe the ferryman?",
            index,
            config,
        }
    }

    #[tokio::test]
    async fn test_finish_after_parallel_queries() {
        let model = Arc::new(scripted_agent(vec![
            MockReply::tool_use("list_chapters", json!({"filter": "Tobin"})),
            MockReply::tool_uses(vec![
                ("query_chapter", json!({"chapter": 2, "question": "What did Tobin owe?"})),
                ("query_chapter", json!({"chapter": 4, "question": "Was it paid?"})),
            ]),
            MockReply::tool_use("finish_retrieval", json!({"summary": "Tobin still owes."})),
        ]));
        let index = index_with(5);
        let config = RetrievalConfig::default();

        let context = planner(model.clone(), Arc::new(NoEntries))
            .retrieve(run_inputs(&index, &config), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        let targets: Vec<_> = context.results.iter().map(|r| r.target).collect();
        assert_eq!(targets, vec![QueryTarget::Chapter(2), QueryTarget::Chapter(4)]);
        assert_eq!(context.summary.as_deref(), Some("Tobin still owes."));
        assert!(!context.partial);
        assert_eq!(context.strategy, PlannerKind::Agentic);
        assert_eq!(model.calls_for(CallPurpose::AgentIteration), 3);

        // The second iteration saw the filtered chapter list.
        let second = &model.requests_for(CallPurpose::AgentIteration)[1];
        let listing = second.messages.last().map(|m| format!("{:?}", m.content)).unwrap_or_default();
        assert!(listing.contains("Chapter 2: Part 2"));
        assert!(!listing.contains("Chapter 1: Part 1"));
    }

    #[tokio::test]
    async fn test_iteration_cap_returns_partial() {
        let model = Arc::new(MockModel::new(|request| match request.purpose {
            CallPurpose::AgentIteration => {
                MockReply::tool_use("query_chapter", json!({"chapter": 1, "question": "Again?"}))
            }
            _ => MockReply::text("Still chapter one."),
        }));
        let index = index_with(2);
        let config = RetrievalConfig::default().with_max_agent_iterations(4);

        let context = planner(model.clone(), Arc::new(NoEntries))
            .retrieve(run_inputs(&index, &config), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(model.calls_for(CallPurpose::AgentIteration), 4);
        assert!(context.partial);
        assert_eq!(context.len(), 4);
    }

    #[tokio::test]
    async fn test_tool_errors_are_reported_to_model() {
        let model = Arc::new(scripted_agent(vec![MockReply::tool_uses(vec![
            ("query_chapter", json!({"chapter": 9, "question": "?"})),
            ("query_chapter_range", json!({"start": 1, "end": 8, "question": "?"})),
            ("summon_dragon", json!({})),
        ])]));
        let index = index_with(8);
        let config = RetrievalConfig::default().with_max_chapters_per_range(3);

        let context = planner(model.clone(), Arc::new(NoEntries))
            .retrieve(run_inputs(&index, &config), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert!(context.is_empty());
        let second = &model.requests_for(CallPurpose::AgentIteration)[1];
        let Some(last) = second.messages.last() else {
            panic!("expected tool results");
        };
        let errors = last
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolResult { is_error: true, .. }))
            .count();
        assert_eq!(errors, 3);
    }

    #[tokio::test]
    async fn test_out_of_bounds_range_is_a_tool_error() {
        let model = Arc::new(scripted_agent(vec![MockReply::tool_uses(vec![
            ("query_chapter_range", json!({"start": 0, "end": u32::MAX, "question": "?"})),
            ("query_chapter_range", json!({"start": 1, "end": u32::MAX, "question": "?"})),
        ])]));
        let index = index_with(1);
        let config = RetrievalConfig::default();

        let context = planner(model.clone(), Arc::new(NoEntries))
            .retrieve(run_inputs(&index, &config), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert!(context.is_empty());
        assert_eq!(model.calls_for(CallPurpose::QueryRange), 0);
        let second = &model.requests_for(CallPurpose::AgentIteration)[1];
        let Some(last) = second.messages.last() else {
            panic!("expected tool results");
        };
        let errors = last
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolResult { is_error: true, .. }))
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test]
    async fn test_range_and_entries_tools() {
        let model = Arc::new(scripted_agent(vec![
            MockReply::tool_uses(vec![
                ("list_entries", json!({})),
                ("query_chapter_range", json!({"start": 2, "end": 3, "question": "How?"})),
            ]),
            MockReply::text("That is everything."),
        ]));
        let entries = StaticEntries(vec![EntrySummary::new("Mira", "character", "Cartographer")]);
        let index = index_with(3);
        let config = RetrievalConfig::default();

        let context = planner(model.clone(), Arc::new(entries))
            .retrieve(run_inputs(&index, &config), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(context.results[0].target, QueryTarget::Range { start: 2, end: 3 });
        assert_eq!(context.summary.as_deref(), Some("That is everything."));
        let second = &model.requests_for(CallPurpose::AgentIteration)[1];
        let results = second.messages.last().map(|m| format!("{:?}", m.content)).unwrap_or_default();
        assert!(results.contains("Mira (character): Cartographer"));
    }

    #[tokio::test]
    async fn test_failed_iteration_yields_none() {
        let model = scripted_agent(vec![MockReply::tool_use("list_chapters", json!({}))]);
        model.fail_next(CallPurpose::AgentIteration, 5);
        let index = index_with(2);
        let config = RetrievalConfig::default();

        let context = planner(Arc::new(model), Arc::new(NoEntries))
            .retrieve(run_inputs(&index, &config), &CancellationToken::new())
            .await
            .unwrap();
        assert!(context.is_none());
    }
}
