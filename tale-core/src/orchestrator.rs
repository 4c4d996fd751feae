//! The public face of the memory engine.
//!
//! [`MemoryOrchestrator`] ties the pieces together for the host application:
//! - `on_user_turn` runs retrieval on the critical path before narration
//! - `on_assistant_turn_classified` cuts chapters in the background
//!
//! Chapter creation is serialized: at most one pipeline runs at a time and
//! a trigger arriving while one is in flight is dropped. The background work
//! is handed back as a [`ChapterTask`] so callers can await it.

use crate::chapter::{Chapter, ChapterNumber};
use crate::config::{ConfigHandle, PlannerKind, RetrievalConfig};
use crate::entries::{EntrySource, NoEntries};
use crate::error::{MemoryError, ModelCallError};
use crate::index::{ChapterIndex, SharedIndex};
use crate::model::ModelClient;
use crate::persist::ChapterStore;
use crate::planner::{AgenticPlanner, PlanInputs, RetrievedContext, StaticPlanner};
use crate::query::QueryExecutor;
use crate::retry::RetryPolicy;
use crate::segmenter::{ChapterSegmenter, SegmentThresholds};
use crate::transcript::TranscriptStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Classifier output for a finished assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationSignal {
    #[serde(default)]
    pub chapter_boundary_due: bool,
    #[serde(default)]
    pub suggested_title: Option<String>,
}

impl ClassificationSignal {
    pub fn boundary() -> Self {
        Self {
            chapter_boundary_due: true,
            suggested_title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.suggested_title = Some(title.into());
        self
    }
}

/// How a background chapter pipeline ended.
#[derive(Debug, Clone)]
pub enum ChapterOutcome {
    /// A chapter was committed to the index.
    Created(Arc<Chapter>),
    /// Nothing was due by the time the pipeline ran.
    Skipped,
    /// Summary or metadata generation failed; retried on a later trigger.
    Abandoned(String),
    Cancelled,
}

impl ChapterOutcome {
    pub fn chapter(&self) -> Option<&Arc<Chapter>> {
        match self {
            ChapterOutcome::Created(chapter) => Some(chapter),
            _ => None,
        }
    }
}

/// Handle to a running chapter pipeline.
#[derive(Debug)]
pub struct ChapterTask {
    handle: JoinHandle<ChapterOutcome>,
    cancel: CancellationToken,
}

impl ChapterTask {
    /// Wait for the pipeline to finish.
    pub async fn wait(self) -> ChapterOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => ChapterOutcome::Cancelled,
            Err(err) => ChapterOutcome::Abandoned(format!("chapter task failed: {err}")),
        }
    }

    /// Abandon the pipeline. In-flight model calls are dropped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStatus {
    pub chapter_count: usize,
    pub transcript_turns: u64,
    /// Last transcript position covered by a chapter (0 if none).
    pub covered_through: u64,
    pub unassigned_turns: u64,
    /// Unassigned turns needed before the next chapter may be cut.
    pub trigger_threshold: u64,
    pub creation_in_flight: bool,
    /// Committed chapters whose save failed and will be retried.
    pub unsaved_chapters: usize,
    /// Strategy the next user turn would use.
    pub planner: PlannerKind,
}

/// Builder for [`MemoryOrchestrator`].
pub struct MemoryOrchestratorBuilder {
    model: Arc<dyn ModelClient>,
    transcript: Arc<dyn TranscriptStore>,
    config: ConfigHandle,
    retry: RetryPolicy,
    store: Option<Arc<dyn ChapterStore>>,
    entries: Arc<dyn EntrySource>,
}

impl MemoryOrchestratorBuilder {
    pub fn config(mut self, config: ConfigHandle) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persist committed chapters to `store`.
    pub fn store(mut self, store: Arc<dyn ChapterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn entries(mut self, entries: Arc<dyn EntrySource>) -> Self {
        self.entries = entries;
        self
    }

    pub fn build(self) -> MemoryOrchestrator {
        MemoryOrchestrator {
            model: self.model,
            transcript: self.transcript,
            index: SharedIndex::new(),
            config: self.config,
            retry: self.retry,
            store: self.store,
            entries: self.entries,
            creation: Arc::new(Mutex::new(())),
            unsaved: Arc::new(parking_lot::Mutex::new(BTreeSet::new())),
            background: CancellationToken::new(),
        }
    }
}

/// Coordinates segmentation, storage and retrieval for one story.
pub struct MemoryOrchestrator {
    model: Arc<dyn ModelClient>,
    transcript: Arc<dyn TranscriptStore>,
    index: SharedIndex,
    config: ConfigHandle,
    retry: RetryPolicy,
    store: Option<Arc<dyn ChapterStore>>,
    entries: Arc<dyn EntrySource>,
    /// Held for the whole chapter pipeline.
    creation: Arc<Mutex<()>>,
    /// Committed chapters not yet in the store, retried on the next commit.
    unsaved: Arc<parking_lot::Mutex<BTreeSet<ChapterNumber>>>,
    /// Parent of every background pipeline's cancellation token.
    background: CancellationToken,
}

impl MemoryOrchestrator {
    pub fn builder(model: Arc<dyn ModelClient>, transcript: Arc<dyn TranscriptStore>) -> MemoryOrchestratorBuilder {
        MemoryOrchestratorBuilder {
            model,
            transcript,
            config: ConfigHandle::default(),
            retry: RetryPolicy::default(),
            store: None,
            entries: Arc::new(NoEntries),
        }
    }

    /// Consistent snapshot of the committed chapters.
    pub fn index(&self) -> ChapterIndex {
        self.index.snapshot()
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Reload committed chapters from the configured store.
    ///
    /// Chapters already in the index are skipped. Restoring stops at the
    /// first chapter that does not continue the index (a gap left by a lost
    /// save); everything before it is kept. Returns how many chapters were
    /// added.
    pub async fn restore(&self) -> Result<usize, MemoryError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let _guard = self.creation.lock().await;

        let saved = store.load_all().await?;
        let known = self.index.count();
        let mut restored = 0;
        for chapter in saved.into_iter().filter(|c| c.number as usize > known) {
            let number = chapter.number;
            if let Err(err) = self.index.append(chapter) {
                tracing::warn!(chapter = number, error = %err, "stored chapters have a gap, restore stopped");
                break;
            }
            restored += 1;
        }
        tracing::info!(restored, total = self.index.count(), "chapters restored");
        Ok(restored)
    }

    /// Retry saving chapters whose earlier save failed.
    ///
    /// Returns how many remain unsaved.
    pub async fn flush_unsaved(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let _guard = self.creation.lock().await;
        persist(store.as_ref(), &self.index, &self.unsaved, None).await
    }

    pub fn status(&self) -> MemoryStatus {
        let config = self.config.snapshot();
        let index = self.index.snapshot();
        let transcript_turns = self.transcript.len();
        let covered_through = index.covered_through();
        MemoryStatus {
            chapter_count: index.count(),
            transcript_turns,
            covered_through,
            unassigned_turns: transcript_turns.saturating_sub(covered_through),
            trigger_threshold: config.trigger_threshold(),
            creation_in_flight: self.creation.try_lock().is_err(),
            unsaved_chapters: self.unsaved.lock().len(),
            planner: config.planner_for(index.count()),
        }
    }

    /// Gather context for the user's new turn.
    ///
    /// Returns `Ok(None)` without any model call when no chapters exist, and
    /// `Ok(None)` when planning fails. Returns [`MemoryError::Cancelled`] if
    /// `cancel` fires; partial results are never returned.
    pub async fn on_user_turn(
        &self,
        user_turn: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RetrievedContext>, MemoryError> {
        let index = self.index.snapshot();
        if index.is_empty() {
            tracing::debug!("no chapters yet, skipping retrieval");
            return Ok(None);
        }

        let config: Arc<RetrievalConfig> = self.config.snapshot();
        let inputs = PlanInputs {
            user_turn,
            index: &index,
            config: &config,
        };
        let executor = QueryExecutor::new(Arc::clone(&self.model), self.retry.clone());
        let kind = config.planner_for(index.count());
        tracing::debug!(planner = ?kind, chapters = index.count(), "retrieval started");

        let context = match kind {
            PlannerKind::Static => {
                StaticPlanner::new(Arc::clone(&self.model), self.retry.clone(), executor)
                    .retrieve(inputs, cancel)
                    .await?
            }
            PlannerKind::Agentic => {
                AgenticPlanner::new(
                    Arc::clone(&self.model),
                    self.retry.clone(),
                    executor,
                    Arc::clone(&self.entries),
                )
                .retrieve(inputs, cancel)
                .await?
            }
        };

        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        Ok(context)
    }

    /// React to a classified assistant turn.
    ///
    /// Starts the chapter pipeline in the background when the signal asks
    /// for a boundary and enough unassigned turns exist. Returns `None` when
    /// nothing was started: no boundary due, below threshold, a pipeline
    /// already in flight, or no async runtime to run on.
    pub fn on_assistant_turn_classified(&self, signal: &ClassificationSignal) -> Option<ChapterTask> {
        if !signal.chapter_boundary_due {
            return None;
        }

        let config = self.config.snapshot();
        let thresholds = SegmentThresholds::from(config.as_ref());
        let unassigned = self.transcript.len().saturating_sub(self.index.covered_through());
        if !thresholds.is_due(unassigned) {
            tracing::debug!(unassigned, threshold = config.trigger_threshold(), "boundary signal below threshold");
            return None;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime, chapter creation not started");
            return None;
        };
        let Ok(guard) = Arc::clone(&self.creation).try_lock_owned() else {
            tracing::debug!("chapter creation already in flight, dropping signal");
            return None;
        };

        let cancel = self.background.child_token();
        let segmenter = ChapterSegmenter::new(Arc::clone(&self.model), self.retry.clone(), thresholds);
        let transcript = Arc::clone(&self.transcript);
        let index = self.index.clone();
        let store = self.store.clone();
        let unsaved = Arc::clone(&self.unsaved);
        let title = signal.suggested_title.clone();
        let task_cancel = cancel.clone();

        let handle = runtime.spawn(async move {
            let _guard = guard;
            let snapshot = index.snapshot();
            let built = segmenter
                .create_chapter(transcript.as_ref(), &snapshot, title.as_deref(), &task_cancel)
                .await;

            match built {
                Ok(None) => ChapterOutcome::Skipped,
                Ok(Some(chapter)) => match index.append(chapter) {
                    Ok(chapter) => {
                        if let Some(store) = store {
                            persist(store.as_ref(), &index, &unsaved, Some(chapter.number)).await;
                        }
                        tracing::info!(chapter = chapter.number, title = %chapter.title, "chapter committed");
                        ChapterOutcome::Created(chapter)
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "chapter rejected by index");
                        ChapterOutcome::Abandoned(err.to_string())
                    }
                },
                Err(MemoryError::Cancelled | MemoryError::Model(ModelCallError::Cancelled)) => {
                    tracing::debug!("chapter creation cancelled");
                    ChapterOutcome::Cancelled
                }
                Err(err) => {
                    tracing::warn!(error = %err, "chapter creation abandoned for this cycle");
                    ChapterOutcome::Abandoned(err.to_string())
                }
            }
        });

        Some(ChapterTask { handle, cancel })
    }

    /// Cancel every background chapter pipeline.
    pub fn cancel_background(&self) {
        self.background.cancel();
    }
}

/// Save `latest` along with every chapter still waiting from a failed save,
/// oldest first. Failures stay queued. Returns the queue length afterwards.
///
/// Callers hold the creation lock, so the queue has a single writer.
async fn persist(
    store: &dyn ChapterStore,
    index: &SharedIndex,
    unsaved: &parking_lot::Mutex<BTreeSet<ChapterNumber>>,
    latest: Option<ChapterNumber>,
) -> usize {
    let mut queue: BTreeSet<ChapterNumber> = unsaved.lock().clone();
    queue.extend(latest);
    if queue.is_empty() {
        return 0;
    }

    let snapshot = index.snapshot();
    let mut still_unsaved = BTreeSet::new();
    for number in queue {
        let Ok(chapter) = snapshot.get(number) else {
            continue;
        };
        match store.save(&chapter).await {
            Ok(()) if Some(number) != latest => {
                tracing::info!(chapter = number, "previously unsaved chapter persisted");
            }
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(chapter = number, error = %err, "failed to persist chapter, will retry");
                still_unsaved.insert(number);
            }
        }
    }

    let remaining = still_unsaved.len();
    *unsaved.lock() = still_unsaved;
    remaining
}

impl Drop for MemoryOrchestrator {
    fn drop(&mut self) {
        self.background.cancel();
    }
}
