//! Chapter segmentation: deciding when and where to cut a new chapter.
//!
//! A chapter is cut once the unassigned tail of the transcript reaches
//! N + X turns. The model picks a natural ending among the oldest N of those
//! turns; the newest X are never candidates. The chapter is then summarized
//! (flagship tier) and its metadata extracted from that summary (fast tier).
//! The chapter is returned fully built; committing it is the caller's job.

use crate::chapter::{Chapter, ChapterMetadata, ChapterNumber};
use crate::config::{ModelTier, RetrievalConfig};
use crate::error::{MemoryError, ModelCallError};
use crate::index::ChapterIndex;
use crate::json::parse_json;
use crate::model::{CallPurpose, ModelClient, ModelRequest};
use crate::retry::{call_with_retry, non_empty_text, RetryPolicy};
use crate::transcript::{Turn, TranscriptStore, TurnId};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const ENDPOINT_SYSTEM: &str = include_str!("prompts/select_endpoint.txt");
const SUMMARY_SYSTEM: &str = include_str!("prompts/summarize.txt");
const METADATA_SYSTEM: &str = include_str!("prompts/extract_metadata.txt");

/// Sentinel shown in place of a prior summary for the first chapter.
const FIRST_CHAPTER: &str = "(This will be the first chapter of the story.)";

/// Segmentation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentThresholds {
    /// Turns per candidate window (N).
    pub chapter_size: u64,
    /// Most recent turns excluded from consideration (X).
    pub protected_buffer: u64,
}

impl SegmentThresholds {
    pub fn new(chapter_size: u64, protected_buffer: u64) -> Self {
        Self {
            chapter_size,
            protected_buffer,
        }
    }

    /// Whether `unassigned` turns warrant cutting a chapter.
    pub fn is_due(&self, unassigned: u64) -> bool {
        unassigned >= self.chapter_size + self.protected_buffer
    }
}

impl From<&RetrievalConfig> for SegmentThresholds {
    fn from(config: &RetrievalConfig) -> Self {
        Self::new(config.chapter_size_threshold, config.protected_buffer)
    }
}

/// The chosen end of a new chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSelection {
    pub endpoint: TurnId,
    pub position: u64,
    pub rationale: String,
    pub suggested_title: Option<String>,
    /// True when the model failed and the deterministic Nth-turn cut was used.
    pub fallback: bool,
    /// True when the model's JSON only parsed after repair.
    pub repaired: bool,
}

#[derive(Debug, Deserialize)]
struct EndpointResponse {
    endpoint_turn: u64,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    title: Option<String>,
}

/// Decides chapter boundaries and builds chapter records.
pub struct ChapterSegmenter {
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    thresholds: SegmentThresholds,
}

impl ChapterSegmenter {
    pub fn new(model: Arc<dyn ModelClient>, retry: RetryPolicy, thresholds: SegmentThresholds) -> Self {
        Self {
            model,
            retry,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> SegmentThresholds {
        self.thresholds
    }

    /// Turns after the last committed chapter.
    pub fn unassigned_turns(transcript: &dyn TranscriptStore, index: &ChapterIndex) -> u64 {
        transcript.len().saturating_sub(index.covered_through())
    }

    /// Whether enough unassigned turns have accumulated.
    pub fn should_trigger(&self, transcript: &dyn TranscriptStore, index: &ChapterIndex) -> bool {
        self.thresholds.is_due(Self::unassigned_turns(transcript, index))
    }

    /// Ask the model for a natural chapter ending among `candidates`.
    ///
    /// Never fails on model trouble: after the retry budget is spent the
    /// last candidate (the Nth turn) is used. Only cancellation is an error.
    pub async fn select_endpoint(
        &self,
        candidates: &[Turn],
        prior_summary: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<EndpointSelection, ModelCallError> {
        let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
            return Err(ModelCallError::Malformed("no candidate turns".to_string()));
        };

        let window = candidates
            .iter()
            .map(Turn::render)
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!(
            "## Previous Chapter Summary\n{}\n\n## Candidate Window (turns {}-{})\n{window}\n\nChoose the endpoint turn.",
            prior_summary.unwrap_or(FIRST_CHAPTER),
            first.position,
            last.position,
        );
        let request = ModelRequest::new(
            CallPurpose::SelectEndpoint,
            ModelTier::Flagship,
            ENDPOINT_SYSTEM,
            prompt,
        )
        .with_temperature(0.0);

        let (low, high) = (first.position, last.position);
        let result = call_with_retry(self.model.as_ref(), &self.retry, &request, cancel, |response| {
            let parsed = parse_json::<EndpointResponse>(&response.text())?;
            let endpoint = parsed.value.endpoint_turn;
            if !(low..=high).contains(&endpoint) {
                return Err(format!("endpoint turn {endpoint} outside candidate window {low}-{high}"));
            }
            Ok(parsed)
        })
        .await;

        match result {
            Ok(parsed) => {
                let repaired = parsed.was_repaired();
                let chosen = parsed.value;
                let turn = &candidates[(chosen.endpoint_turn - low) as usize];
                tracing::debug!(endpoint = turn.position, repaired, "chapter endpoint selected");
                Ok(EndpointSelection {
                    endpoint: turn.id,
                    position: turn.position,
                    rationale: chosen.rationale,
                    suggested_title: chosen.title.filter(|t| !t.trim().is_empty()),
                    fallback: false,
                    repaired,
                })
            }
            Err(ModelCallError::Cancelled) => Err(ModelCallError::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, endpoint = last.position, "endpoint selection failed, cutting at window end");
                Ok(EndpointSelection {
                    endpoint: last.id,
                    position: last.position,
                    rationale: "Fell back to the end of the candidate window.".to_string(),
                    suggested_title: None,
                    fallback: true,
                    repaired: false,
                })
            }
        }
    }

    /// Summarize a chapter's turns in 2-4 paragraphs.
    pub async fn summarize(
        &self,
        turns: &[Turn],
        number: ChapterNumber,
        cancel: &CancellationToken,
    ) -> Result<String, ModelCallError> {
        let transcript = turns.iter().map(Turn::render).collect::<Vec<_>>().join("\n\n");
        let prompt = format!("## Chapter {number} Transcript\n{transcript}\n\nWrite the summary.");
        let request = ModelRequest::new(CallPurpose::Summarize, ModelTier::Flagship, SUMMARY_SYSTEM, prompt);

        call_with_retry(self.model.as_ref(), &self.retry, &request, cancel, non_empty_text).await
    }

    /// Extract structured metadata from an already produced summary.
    pub async fn extract_metadata(
        &self,
        turns: &[Turn],
        summary: &str,
        cancel: &CancellationToken,
    ) -> Result<ChapterMetadata, ModelCallError> {
        let span = match (turns.first(), turns.last()) {
            (Some(first), Some(last)) => format!("turns {}-{}", first.position, last.position),
            _ => "no turns".to_string(),
        };
        let prompt = format!("## Chapter Summary ({span})\n{summary}\n\nExtract the metadata.");
        let request = ModelRequest::new(
            CallPurpose::ExtractMetadata,
            ModelTier::Fast,
            METADATA_SYSTEM,
            prompt,
        )
        .with_temperature(0.0);

        let parsed = call_with_retry(self.model.as_ref(), &self.retry, &request, cancel, |response| {
            parse_json::<ChapterMetadata>(&response.text())
        })
        .await?;
        tracing::debug!(
            characters = parsed.value.characters.len(),
            repaired = parsed.was_repaired(),
            "chapter metadata extracted"
        );
        Ok(parsed.value)
    }

    /// Build the next chapter if one is due.
    ///
    /// Returns `Ok(None)` when the unassigned tail is below threshold, which
    /// also covers a duplicate trigger for a boundary already committed.
    pub async fn create_chapter(
        &self,
        transcript: &dyn TranscriptStore,
        index: &ChapterIndex,
        title_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Chapter>, MemoryError> {
        let unassigned = Self::unassigned_turns(transcript, index);
        if !self.thresholds.is_due(unassigned) {
            tracing::debug!(unassigned, "chapter not due");
            return Ok(None);
        }

        let number = index.next_number();
        let window_start = index.covered_through() + 1;
        let window_end = window_start + self.thresholds.chapter_size - 1;
        let candidates = transcript.turns_between(window_start, window_end);

        let prior_summary = index.last().map(|c| c.summary.clone());
        let selection = self
            .select_endpoint(&candidates, prior_summary.as_deref(), cancel)
            .await?;

        let member_count = (selection.position - window_start + 1) as usize;
        let turns = &candidates[..member_count];

        let summary = self.summarize(turns, number, cancel).await?;
        let metadata = self.extract_metadata(turns, &summary, cancel).await?;

        let title = title_hint
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or(selection.suggested_title)
            .unwrap_or_else(|| format!("Chapter {number}"));

        let chapter = Chapter::from_turns(number, title, turns, summary, metadata)?;
        tracing::info!(
            chapter = number,
            start = chapter.start_position,
            end = chapter.end_position,
            fallback = selection.fallback,
            "chapter built"
        );
        Ok(Some(chapter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_story_model, transcript_with, MockModel, MockReply};

    fn segmenter(model: MockModel, n: u64, x: u64) -> ChapterSegmenter {
        ChapterSegmenter::new(Arc::new(model), RetryPolicy::immediate(), SegmentThresholds::new(n, x))
    }

    #[test]
    fn test_threshold_trigger() {
        let thresholds = SegmentThresholds::new(50, 10);
        assert!(!thresholds.is_due(0));
        assert!(!thresholds.is_due(59));
        assert!(thresholds.is_due(60));
        assert!(thresholds.is_due(61));
    }

    #[test]
    fn test_should_trigger_counts_only_unassigned() {
        let seg = segmenter(scripted_story_model(0), 50, 10);
        let index = ChapterIndex::new();
        assert!(!seg.should_trigger(transcript_with(59).as_ref(), &index));
        assert!(seg.should_trigger(transcript_with(60).as_ref(), &index));
    }

    #[tokio::test]
    async fn test_select_endpoint_uses_model_choice() {
        let seg = segmenter(scripted_story_model(20), 50, 10);
        let transcript = transcript_with(61);
        let candidates = transcript.turns_between(1, 50);

        let selection = seg
            .select_endpoint(&candidates, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(selection.position, 21);
        assert_eq!(selection.endpoint, candidates[20].id);
        assert_eq!(selection.suggested_title.as_deref(), Some("Leaving the City"));
        assert!(!selection.fallback);
    }

    #[tokio::test]
    async fn test_select_endpoint_reports_repaired_json() {
        let model = MockModel::new(|_| {
            MockReply::text("Here you go:\n```json\n{\"endpoint_turn\": 30, \"rationale\": \"Dawn breaks\",}\n```")
        });
        let seg = segmenter(model, 50, 10);
        let transcript = transcript_with(61);
        let candidates = transcript.turns_between(1, 50);

        let selection = seg
            .select_endpoint(&candidates, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(selection.position, 30);
        assert!(selection.repaired);
        assert!(!selection.fallback);
    }

    #[tokio::test]
    async fn test_select_endpoint_falls_back_when_out_of_window() {
        let model = MockModel::new(|_| MockReply::json(serde_json::json!({"endpoint_turn": 58})));
        let seg = segmenter(model, 50, 10);
        let transcript = transcript_with(61);
        let candidates = transcript.turns_between(1, 50);

        let selection = seg
            .select_endpoint(&candidates, Some("Earlier things"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(selection.fallback);
        assert_eq!(selection.position, 50);
    }

    #[tokio::test]
    async fn test_select_endpoint_falls_back_after_transient_failures() {
        let model = scripted_story_model(5);
        model.fail_next(CallPurpose::SelectEndpoint, 5);
        let model = Arc::new(model);
        let seg = ChapterSegmenter::new(
            model.clone(),
            RetryPolicy::immediate(),
            SegmentThresholds::new(50, 10),
        );
        let transcript = transcript_with(60);
        let candidates = transcript.turns_between(1, 50);

        let selection = seg
            .select_endpoint(&candidates, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(selection.fallback);
        assert_eq!(selection.position, 50);
        assert_eq!(model.calls_for(CallPurpose::SelectEndpoint), 5);
    }

    #[tokio::test]
    async fn test_first_chapter_prompt_uses_sentinel() {
        let model = Arc::new(scripted_story_model(3));
        let seg = ChapterSegmenter::new(model.clone(), RetryPolicy::immediate(), SegmentThresholds::new(50, 10));
        let transcript = transcript_with(60);

        seg.create_chapter(transcript.as_ref(), &ChapterIndex::new(), None, &CancellationToken::new())
            .await
            .unwrap();

        let prompt = model.requests_for(CallPurpose::SelectEndpoint)[0].prompt();
        assert!(prompt.contains(FIRST_CHAPTER));
        assert!(prompt.contains("[Turn 50]"));
        assert!(!prompt.contains("[Turn 51]"));
    }

    #[tokio::test]
    async fn test_create_chapter_builds_full_record() {
        let model = Arc::new(scripted_story_model(29));
        let seg = ChapterSegmenter::new(model.clone(), RetryPolicy::immediate(), SegmentThresholds::new(50, 10));
        let transcript = transcript_with(61);

        let chapter = seg
            .create_chapter(transcript.as_ref(), &ChapterIndex::new(), None, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(chapter.number, 1);
        assert_eq!(chapter.start_position, 1);
        assert_eq!(chapter.end_position, 30);
        assert_eq!(chapter.turn_count, 30);
        assert_eq!(chapter.title, "Leaving the City");
        assert_eq!(chapter.metadata.characters, vec!["Mira", "Tobin"]);
        assert!(chapter.summary.contains("left at dawn"));

        // Metadata extraction reads the summary, not the transcript.
        let metadata_prompt = model.requests_for(CallPurpose::ExtractMetadata)[0].prompt();
        assert!(metadata_prompt.contains("left at dawn"));
        assert!(!metadata_prompt.contains("Player action"));
    }

    #[tokio::test]
    async fn test_classifier_title_wins() {
        let seg = segmenter(scripted_story_model(0), 5, 1);
        let transcript = transcript_with(6);

        let chapter = seg
            .create_chapter(transcript.as_ref(), &ChapterIndex::new(), Some("The Storm"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(chapter.title, "The Storm");
        assert_eq!(chapter.end_position, 1);
    }

    #[tokio::test]
    async fn test_create_chapter_not_due() {
        let model = Arc::new(scripted_story_model(0));
        let seg = ChapterSegmenter::new(model.clone(), RetryPolicy::immediate(), SegmentThresholds::new(50, 10));
        let transcript = transcript_with(59);

        let result = seg
            .create_chapter(transcript.as_ref(), &ChapterIndex::new(), None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(model.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_summary_failure_abandons_chapter() {
        let model = scripted_story_model(10);
        model.fail_next(CallPurpose::Summarize, 5);
        let seg = segmenter(model, 50, 10);
        let transcript = transcript_with(60);

        let result = seg
            .create_chapter(transcript.as_ref(), &ChapterIndex::new(), None, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(MemoryError::Model(ModelCallError::Exhausted { purpose: CallPurpose::Summarize, .. }))
        ));
    }
}
