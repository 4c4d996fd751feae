//! Testing utilities for the memory engine.
//!
//! This module provides tools for deterministic tests without API calls:
//! - `MockModel`, a scripted [`ModelClient`] that routes on request content
//! - Injected failures and delays per call purpose
//! - Transcript builders and a `TestHarness` wiring an orchestrator together

use crate::config::{ConfigHandle, RetrievalConfig};
use crate::entries::{EntrySource, EntrySummary};
use crate::model::{CallPurpose, ModelClient, ModelRequest};
use crate::orchestrator::MemoryOrchestrator;
use crate::persist::{ChapterStore, InMemoryChapterStore};
use crate::retry::RetryPolicy;
use crate::transcript::InMemoryTranscript;
use async_trait::async_trait;
use claude::{ContentBlock, Response, StopReason, Usage};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A scripted reply from the mock model.
pub enum MockReply {
    /// Plain text, ending the turn.
    Text(String),
    /// Tool calls as `(name, input)` pairs.
    ToolUses(Vec<(String, Value)>),
    /// A client error.
    Fail(claude::Error),
    /// Another reply, sent after a pause.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    pub fn json(value: Value) -> Self {
        MockReply::Text(value.to_string())
    }

    pub fn tool_use(name: impl Into<String>, input: Value) -> Self {
        MockReply::ToolUses(vec![(name.into(), input)])
    }

    pub fn tool_uses(calls: Vec<(&str, Value)>) -> Self {
        MockReply::ToolUses(calls.into_iter().map(|(n, v)| (n.to_string(), v)).collect())
    }

    /// A transient network failure.
    pub fn transient() -> Self {
        MockReply::Fail(claude::Error::Network("connection reset".to_string()))
    }

    /// A failure retrying will not fix.
    pub fn permanent() -> Self {
        MockReply::Fail(claude::Error::Api {
            status: 400,
            message: "invalid request".to_string(),
        })
    }

    pub fn after(self, delay: Duration) -> Self {
        MockReply::Delayed(delay, Box::new(self))
    }
}

type Handler = dyn Fn(&ModelRequest) -> MockReply + Send + Sync;

/// A model that answers through a closure and records every request.
pub struct MockModel {
    handler: Box<Handler>,
    calls: Mutex<Vec<ModelRequest>>,
    pending_failures: Mutex<HashMap<CallPurpose, u32>>,
    delays: Mutex<HashMap<CallPurpose, Duration>>,
    next_id: AtomicUsize,
}

impl MockModel {
    /// Create a mock answering every request with `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ModelRequest) -> MockReply + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            pending_failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` calls for `purpose` with a transient error.
    pub fn fail_next(&self, purpose: CallPurpose, count: u32) {
        *self.pending_failures.lock().entry(purpose).or_default() += count;
    }

    /// Delay every reply for `purpose`.
    pub fn delay(&self, purpose: CallPurpose, delay: Duration) {
        self.delays.lock().insert(purpose, delay);
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.calls.lock().clone()
    }

    pub fn requests_for(&self, purpose: CallPurpose) -> Vec<ModelRequest> {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.purpose == purpose)
            .cloned()
            .collect()
    }

    pub fn calls_for(&self, purpose: CallPurpose) -> usize {
        self.calls.lock().iter().filter(|r| r.purpose == purpose).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn take_failure(&self, purpose: CallPurpose) -> bool {
        let mut failures = self.pending_failures.lock();
        match failures.get_mut(&purpose) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn build_response(&self, reply: MockReply) -> Result<Response, claude::Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (content, stop_reason) = match reply {
            MockReply::Fail(err) => return Err(err),
            MockReply::Delayed(_, inner) => return self.build_response(*inner),
            MockReply::Text(text) => (vec![ContentBlock::Text { text }], StopReason::EndTurn),
            MockReply::ToolUses(calls) => (
                calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, input))| ContentBlock::ToolUse {
                        id: format!("toolu_{id}_{i}"),
                        name,
                        input,
                    })
                    .collect(),
                StopReason::ToolUse,
            ),
        };

        Ok(Response {
            id: format!("msg_mock_{id}"),
            model: "mock".to_string(),
            content,
            stop_reason,
            usage: Usage::default(),
        })
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn complete(&self, request: ModelRequest) -> Result<Response, claude::Error> {
        let purpose = request.purpose;
        self.calls.lock().push(request.clone());

        let delay = self.delays.lock().get(&purpose).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure(purpose) {
            return Err(claude::Error::Network("injected failure".to_string()));
        }

        let mut reply = (self.handler)(&request);
        while let MockReply::Delayed(delay, inner) = reply {
            tokio::time::sleep(delay).await;
            reply = *inner;
        }
        self.build_response(reply)
    }
}

/// Fixed list of lore entries.
#[derive(Debug, Clone, Default)]
pub struct StaticEntries(pub Vec<EntrySummary>);

impl EntrySource for StaticEntries {
    fn list_entries(&self) -> Vec<EntrySummary> {
        self.0.clone()
    }
}

/// A transcript of `turns` alternating user/assistant turns.
pub fn transcript_with(turns: u64) -> Arc<InMemoryTranscript> {
    let transcript = Arc::new(InMemoryTranscript::new());
    extend_transcript(&transcript, turns);
    transcript
}

/// Append `turns` alternating turns to an existing transcript.
pub fn extend_transcript(transcript: &InMemoryTranscript, turns: u64) {
    use crate::transcript::TranscriptStore;
    for _ in 0..turns {
        let position = transcript.len() + 1;
        if position % 2 == 1 {
            transcript.push_user(format!("Player action {position}"));
        } else {
            transcript.push_assistant(format!("Narration {position}"));
        }
    }
}

/// Pull the first number following `marker` out of a prompt.
pub fn number_after(text: &str, marker: &str) -> Option<u64> {
    let start = text.find(marker)? + marker.len();
    let digits: String = text[start..]
        .chars()
        .skip_while(|c| c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Orchestrator wired to a mock model, in-memory transcript and store.
pub struct TestHarness {
    pub model: Arc<MockModel>,
    pub transcript: Arc<InMemoryTranscript>,
    pub store: Arc<InMemoryChapterStore>,
    pub config: ConfigHandle,
    pub orchestrator: MemoryOrchestrator,
}

impl TestHarness {
    /// Build a harness with `turns` transcript turns and zero-delay retries.
    pub fn new(model: MockModel, config: RetrievalConfig, turns: u64) -> Self {
        let model = Arc::new(model);
        let transcript = transcript_with(turns);
        let store = Arc::new(InMemoryChapterStore::new());
        let config = ConfigHandle::new(config);
        let orchestrator = MemoryOrchestrator::builder(
            Arc::clone(&model) as Arc<dyn ModelClient>,
            Arc::clone(&transcript) as Arc<dyn crate::transcript::TranscriptStore>,
        )
        .config(config.clone())
        .retry(RetryPolicy::immediate())
        .store(Arc::clone(&store) as Arc<dyn ChapterStore>)
        .build();

        Self {
            model,
            transcript,
            store,
            config,
            orchestrator,
        }
    }
}

/// A mock that handles every purpose with plausible, well-formed output.
///
/// Endpoint selection picks the candidate turn `endpoint_offset` turns into
/// the window; queries answer with the chapter number they were asked about.
pub fn scripted_story_model(endpoint_offset: u64) -> MockModel {
    MockModel::new(move |request| match request.purpose {
        CallPurpose::SelectEndpoint => {
            let first = number_after(&request.prompt(), "[Turn").unwrap_or(1);
            MockReply::json(serde_json::json!({
                "endpoint_turn": first + endpoint_offset,
                "rationale": "The party leaves the city.",
                "title": "Leaving the City"
            }))
        }
        CallPurpose::Summarize => MockReply::text(
            "The party gathered in the city and argued about the map.\n\nThey left at dawn.",
        ),
        CallPurpose::ExtractMetadata => MockReply::json(serde_json::json!({
            "keywords": ["map", "dawn"],
            "characters": ["Mira", "Tobin"],
            "locations": ["Vharn"],
            "plot_threads": ["The missing map"],
            "emotional_tone": "Uneasy resolve"
        })),
        CallPurpose::RetrievalDecision => MockReply::json(serde_json::json!({"queries": []})),
        CallPurpose::QueryChapter => {
            let chapter = number_after(&request.prompt(), "Chapter").unwrap_or(0);
            MockReply::text(format!("Answer from chapter {chapter}."))
        }
        CallPurpose::QueryRange => MockReply::text("Range answer."),
        CallPurpose::AgentIteration => MockReply::tool_use(
            "finish_retrieval",
            serde_json::json!({"summary": "Nothing further needed."}),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelTier;

    #[test]
    fn test_number_after() {
        assert_eq!(number_after("## Chapter 12: Title", "Chapter"), Some(12));
        assert_eq!(number_after("[Turn 3] User", "[Turn"), Some(3));
        assert_eq!(number_after("no marker", "Chapter"), None);
    }

    #[tokio::test]
    async fn test_mock_records_and_fails_on_demand() {
        let model = MockModel::new(|_| MockReply::text("ok"));
        model.fail_next(CallPurpose::QueryChapter, 1);
        let request = ModelRequest::new(CallPurpose::QueryChapter, ModelTier::Fast, "s", "p");

        assert!(model.complete(request.clone()).await.is_err());
        let response = model.complete(request).await.unwrap();

        assert_eq!(response.text(), "ok");
        assert_eq!(model.calls_for(CallPurpose::QueryChapter), 2);
    }

    #[tokio::test]
    async fn test_mock_tool_uses_have_unique_ids() {
        let model = MockModel::new(|_| {
            MockReply::tool_uses(vec![
                ("list_chapters", serde_json::json!({})),
                ("list_entries", serde_json::json!({})),
            ])
        });
        let request = ModelRequest::new(CallPurpose::AgentIteration, ModelTier::Fast, "s", "p");
        let response = model.complete(request).await.unwrap();

        let uses = response.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_ne!(uses[0].id, uses[1].id);
        assert_eq!(response.stop_reason, StopReason::ToolUse);
    }
}
