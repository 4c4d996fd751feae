//! Chapter memory and retrieval for long-running AI interactive fiction.
//!
//! This crate provides:
//! - Automatic segmentation of the transcript into summarized chapters
//! - An append-only chapter index with point and range lookup
//! - Retrieval planning (one-shot or agentic) before each narrator response
//! - Uniform retry, JSON repair and cancellation for every model call
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tale_core::{ClaudeModel, ClassificationSignal, InMemoryTranscript, MemoryOrchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     tale_core::telemetry::init();
//!     let transcript = Arc::new(InMemoryTranscript::new());
//!     let memory = MemoryOrchestrator::builder(Arc::new(ClaudeModel::from_env()?), transcript.clone()).build();
//!
//!     transcript.push_user("I ask the ferryman about the debt.");
//!     let context = memory.on_user_turn("I ask the ferryman about the debt.", &CancellationToken::new()).await?;
//!
//!     transcript.push_assistant("The ferryman squints at you...");
//!     if let Some(task) = memory.on_assistant_turn_classified(&ClassificationSignal::boundary()) {
//!         task.wait().await;
//!     }
//!     Ok(())
//! }
//! ```

// Lets `#[derive(Tool)]` output resolve `::tale_core` inside this crate.
extern crate self as tale_core;

pub mod chapter;
pub mod config;
pub mod entries;
pub mod error;
pub mod index;
pub mod json;
pub mod model;
pub mod orchestrator;
pub mod persist;
pub mod planner;
pub mod query;
pub mod retry;
pub mod segmenter;
pub mod telemetry;
pub mod testing;
pub mod tools;
pub mod transcript;

// Re-export for convenience
pub use tale_macros::Tool;

// Primary public API
pub use chapter::{Chapter, ChapterMetadata, ChapterNumber, ChapterPreview};
pub use config::{ConfigHandle, ModelConfig, ModelTier, PlannerKind, PlannerMode, RetrievalConfig};
pub use entries::{EntrySource, EntrySummary, NoEntries};
pub use error::{IndexError, MemoryError, ModelCallError, PersistError};
pub use index::ChapterIndex;
pub use model::{CallPurpose, ClaudeModel, ModelClient, ModelRequest};
pub use orchestrator::{ChapterOutcome, ChapterTask, ClassificationSignal, MemoryOrchestrator, MemoryStatus};
pub use persist::{ChapterStore, InMemoryChapterStore, JsonChapterStore};
pub use planner::RetrievedContext;
pub use query::{QueryResult, QueryTarget};
pub use retry::RetryPolicy;
pub use testing::{MockModel, MockReply, TestHarness};
pub use transcript::{InMemoryTranscript, TranscriptStore, Turn, TurnId, TurnRole};
