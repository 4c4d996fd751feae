//! One-shot retrieval: a single decision call followed by parallel queries.

use super::{PlanInputs, RetrievedContext};
use crate::chapter::ChapterNumber;
use crate::config::{ModelTier, PlannerKind};
use crate::error::{MemoryError, ModelCallError};
use crate::index::ChapterIndex;
use crate::json::parse_json;
use crate::model::{CallPurpose, ModelClient, ModelRequest};
use crate::query::QueryExecutor;
use crate::retry::{call_with_retry, RetryPolicy};
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DECISION_SYSTEM: &str = include_str!("../prompts/retrieval_decision.txt");

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    queries: Vec<PlannedQuery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlannedQuery {
    pub chapter: ChapterNumber,
    pub question: String,
}

/// Which chapters to query this turn, and what to ask each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalDecision {
    pub queries: Vec<PlannedQuery>,
    /// True when the decision JSON only parsed after repair.
    pub repaired: bool,
}

impl RetrievalDecision {
    /// Keep queries naming existing chapters, then the first `max` of those
    /// in the order the model gave them.
    pub fn from_planned(planned: Vec<PlannedQuery>, index: &ChapterIndex, max: usize) -> Self {
        let total = planned.len();
        let mut queries: Vec<PlannedQuery> = planned
            .into_iter()
            .filter(|q| index.get(q.chapter).is_ok() && !q.question.trim().is_empty())
            .collect();
        let valid = queries.len();
        queries.truncate(max);

        if valid < total || queries.len() < valid {
            tracing::debug!(
                requested = total,
                invalid = total - valid,
                kept = queries.len(),
                "retrieval decision trimmed"
            );
        }
        Self {
            queries,
            repaired: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Decide-then-query strategy.
pub struct StaticPlanner {
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    executor: QueryExecutor,
}

impl StaticPlanner {
    pub fn new(model: Arc<dyn ModelClient>, retry: RetryPolicy, executor: QueryExecutor) -> Self {
        Self {
            model,
            retry,
            executor,
        }
    }

    /// Ask the model which chapters are worth querying.
    pub async fn decide(
        &self,
        inputs: PlanInputs<'_>,
        cancel: &CancellationToken,
    ) -> Result<RetrievalDecision, ModelCallError> {
        let previews = inputs
            .index
            .list()
            .iter()
            .map(|p| p.render())
            .collect::<Vec<_>>()
            .join("\n");
        let max = inputs.config.max_queries_per_turn;
        let prompt = format!(
            "## Player Message\n{}\n\n## Chapters\n{previews}\nPick at most {max} chapters. An empty list is fine.",
            inputs.user_turn
        );
        let request = ModelRequest::new(
            CallPurpose::RetrievalDecision,
            ModelTier::Fast,
            DECISION_SYSTEM,
            prompt,
        )
        .with_temperature(0.0);

        let parsed = call_with_retry(self.model.as_ref(), &self.retry, &request, cancel, |response| {
            parse_json::<DecisionResponse>(&response.text())
        })
        .await?;

        let repaired = parsed.was_repaired();
        let mut decision = RetrievalDecision::from_planned(parsed.value.queries, inputs.index, max);
        decision.repaired = repaired;
        tracing::debug!(queries = decision.queries.len(), repaired, "retrieval decision made");
        Ok(decision)
    }

    /// Run the full decide-and-query cycle.
    ///
    /// A failed decision yields `Ok(None)`. A failed query is dropped from
    /// the result; the others are kept.
    pub async fn retrieve(
        &self,
        inputs: PlanInputs<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<RetrievedContext>, MemoryError> {
        let decision = match self.decide(inputs, cancel).await {
            Ok(decision) => decision,
            Err(ModelCallError::Cancelled) => return Err(MemoryError::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "retrieval decision failed, continuing without context");
                return Ok(None);
            }
        };

        if decision.is_empty() {
            tracing::debug!("no chapters selected");
            return Ok(Some(RetrievedContext::new(PlannerKind::Static, Vec::new())));
        }

        let queries = decision.queries.iter().map(|planned| async move {
            let chapter = inputs.index.get(planned.chapter)?;
            self.executor
                .query_chapter(&chapter, &planned.question, cancel)
                .await
                .map_err(MemoryError::from)
        });
        let outcomes = join_all(queries).await;

        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        let mut results = Vec::with_capacity(outcomes.len());
        for (planned, outcome) in decision.queries.iter().zip(outcomes) {
            match outcome {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::warn!(chapter = planned.chapter, error = %err, "chapter query failed, omitting");
                }
            }
        }

        tracing::info!(selected = decision.queries.len(), answered = results.len(), "static retrieval complete");
        Ok(Some(RetrievedContext::new(PlannerKind::Static, results)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::{Chapter, ChapterMetadata};
    use crate::config::RetrievalConfig;
    use crate::query::QueryTarget;
    use crate::testing::{number_after, transcript_with, MockModel, MockReply};
    use crate::transcript::TranscriptStore;
    use serde_json::json;

    fn index_with(count: u32) -> ChapterIndex {
        let transcript = transcript_with(count as u64 * 2);
        let mut index = ChapterIndex::new();
        for n in 1..=count {
            let start = (n as u64 - 1) * 2 + 1;
            let turns = transcript.turns_between(start, start + 1);
            let chapter =
                Chapter::from_turns(n, format!("Part {n}"), &turns, format!("Summary {n}."), ChapterMetadata::default())
                    .unwrap();
            index.append(chapter).unwrap();
        }
        index
    }

    fn planner(model: Arc<MockModel>) -> StaticPlanner {
        let executor = QueryExecutor::new(model.clone(), RetryPolicy::immediate());
        StaticPlanner::new(model, RetryPolicy::immediate(), executor)
    }

    fn decision_model(queries: serde_json::Value) -> MockModel {
        MockModel::new(move |request| match request.purpose {
            CallPurpose::RetrievalDecision => MockReply::json(json!({ "queries": queries.clone() })),
            _ => {
                let chapter = number_after(&request.prompt(), "Chapter").unwrap_or(0);
                MockReply::text(format!("Answer from chapter {chapter}."))
            }
        })
    }

    fn planned(chapter: ChapterNumber) -> PlannedQuery {
        PlannedQuery {
            chapter,
            question: format!("What happened in {chapter}?"),
        }
    }

    #[test]
    fn test_decision_drops_invalid_then_truncates() {
        let index = index_with(5);
        let decision = RetrievalDecision::from_planned(
            vec![planned(9), planned(2), planned(0), planned(4), planned(5), planned(1)],
            &index,
            3,
        );
        let chapters: Vec<_> = decision.queries.iter().map(|q| q.chapter).collect();
        assert_eq!(chapters, vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn test_decision_reports_repaired_json() {
        let model = Arc::new(MockModel::new(|_| {
            MockReply::text("```json\n{\"queries\": [{\"chapter\": 2, \"question\": \"Who paid?\"},]}\n```")
        }));
        let index = index_with(3);
        let config = RetrievalConfig::default();
        let inputs = PlanInputs {
            user_turn: "I pay the toll.",
            index: &index,
            config: &config,
        };

        let decision = planner(model).decide(inputs, &CancellationToken::new()).await.unwrap();

        assert!(decision.repaired);
        assert_eq!(decision.queries, vec![PlannedQuery { chapter: 2, question: "Who paid?".to_string() }]);
    }

    #[tokio::test]
    async fn test_zero_queries_is_valid() {
        let model = Arc::new(decision_model(json!([])));
        let index = index_with(3);
        let config = RetrievalConfig::default();
        let inputs = PlanInputs {
            user_turn: "I look around.",
            index: &index,
            config: &config,
        };

        let context = planner(model.clone())
            .retrieve(inputs, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert!(context.is_empty());
        assert_eq!(model.calls_for(CallPurpose::QueryChapter), 0);
    }

    #[tokio::test]
    async fn test_decision_prompt_lists_chapters() {
        let model = Arc::new(decision_model(json!([])));
        let index = index_with(2);
        let config = RetrievalConfig::default();
        let inputs = PlanInputs {
            user_turn: "Where is the map?",
            index: &index,
            config: &config,
        };

        planner(model.clone()).decide(inputs, &CancellationToken::new()).await.unwrap();

        let prompt = model.requests_for(CallPurpose::RetrievalDecision)[0].prompt();
        assert!(prompt.contains("Where is the map?"));
        assert!(prompt.contains("### Chapter 1: Part 1"));
        assert!(prompt.contains("Summary 2."));
    }

    #[tokio::test]
    async fn test_failed_decision_yields_none() {
        let model = decision_model(json!([]));
        model.fail_next(CallPurpose::RetrievalDecision, 5);
        let model = Arc::new(model);
        let index = index_with(2);
        let config = RetrievalConfig::default();
        let inputs = PlanInputs {
            user_turn: "Hello",
            index: &index,
            config: &config,
        };

        let context = planner(model).retrieve(inputs, &CancellationToken::new()).await.unwrap();
        assert!(context.is_none());
    }

    #[tokio::test]
    async fn test_results_follow_decision_order() {
        let model = Arc::new(decision_model(json!([
            {"chapter": 3, "question": "Who?"},
            {"chapter": 1, "question": "Where?"}
        ])));
        let index = index_with(3);
        let config = RetrievalConfig::default();
        let inputs = PlanInputs {
            user_turn: "Remember?",
            index: &index,
            config: &config,
        };

        let context = planner(model).retrieve(inputs, &CancellationToken::new()).await.unwrap().unwrap();

        let targets: Vec<_> = context.results.iter().map(|r| r.target).collect();
        assert_eq!(targets, vec![QueryTarget::Chapter(3), QueryTarget::Chapter(1)]);
        assert_eq!(context.results[0].answer, "Answer from chapter 3.");
        assert_eq!(context.strategy, PlannerKind::Static);
    }
}
