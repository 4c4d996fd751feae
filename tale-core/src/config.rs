//! Configuration for the memory engine.
//!
//! Configuration is passed explicitly to each component. The orchestrator
//! reads it through a [`ConfigHandle`], which the settings layer can update
//! at any time; every decision works from the snapshot it took at its start.

use crate::error::MemoryError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Which retrieval strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlannerMode {
    Static,
    Agentic,
    /// Static until the chapter count reaches `agentic_threshold`.
    #[default]
    Auto,
}

/// A concrete strategy, after resolving `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannerKind {
    Static,
    Agentic,
}

/// Thresholds controlling segmentation and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Turns per chapter window (N).
    pub chapter_size_threshold: u64,
    /// Most recent turns never eligible as a chapter ending (X).
    pub protected_buffer: u64,
    /// Cap on queries issued for a single user turn.
    pub max_queries_per_turn: usize,
    /// Cap on chapters in one range query.
    pub max_chapters_per_range: u32,
    pub planner_mode: PlannerMode,
    /// Hard cap on agentic loop iterations.
    pub max_agent_iterations: u32,
    /// Chapter count at which `Auto` switches to agentic.
    pub agentic_threshold: usize,
    /// Approximate token budget for a range query's source text.
    pub range_budget_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chapter_size_threshold: 50,
            protected_buffer: 10,
            max_queries_per_turn: 3,
            max_chapters_per_range: 5,
            planner_mode: PlannerMode::Auto,
            max_agent_iterations: 5,
            agentic_threshold: 20,
            range_budget_tokens: 24_000,
        }
    }
}

impl RetrievalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chapter_size(mut self, turns: u64) -> Self {
        self.chapter_size_threshold = turns;
        self
    }

    pub fn with_protected_buffer(mut self, turns: u64) -> Self {
        self.protected_buffer = turns;
        self
    }

    pub fn with_max_queries(mut self, max: usize) -> Self {
        self.max_queries_per_turn = max;
        self
    }

    pub fn with_max_chapters_per_range(mut self, max: u32) -> Self {
        self.max_chapters_per_range = max;
        self
    }

    pub fn with_planner_mode(mut self, mode: PlannerMode) -> Self {
        self.planner_mode = mode;
        self
    }

    pub fn with_max_agent_iterations(mut self, max: u32) -> Self {
        self.max_agent_iterations = max;
        self
    }

    pub fn with_agentic_threshold(mut self, chapters: usize) -> Self {
        self.agentic_threshold = chapters;
        self
    }

    pub fn with_range_budget_tokens(mut self, tokens: usize) -> Self {
        self.range_budget_tokens = tokens;
        self
    }

    /// Unassigned turns needed before a chapter may be cut (N + X).
    pub fn trigger_threshold(&self) -> u64 {
        self.chapter_size_threshold + self.protected_buffer
    }

    /// Resolve the planner for a story with `chapter_count` chapters.
    /// Reaching the threshold exactly selects agentic.
    pub fn planner_for(&self, chapter_count: usize) -> PlannerKind {
        match self.planner_mode {
            PlannerMode::Static => PlannerKind::Static,
            PlannerMode::Agentic => PlannerKind::Agentic,
            PlannerMode::Auto if chapter_count >= self.agentic_threshold => PlannerKind::Agentic,
            PlannerMode::Auto => PlannerKind::Static,
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.chapter_size_threshold == 0 {
            return Err(MemoryError::Config("chapter_size_threshold must be at least 1".into()));
        }
        if self.max_queries_per_turn == 0 {
            return Err(MemoryError::Config("max_queries_per_turn must be at least 1".into()));
        }
        if self.max_chapters_per_range == 0 {
            return Err(MemoryError::Config("max_chapters_per_range must be at least 1".into()));
        }
        if self.max_agent_iterations == 0 {
            return Err(MemoryError::Config("max_agent_iterations must be at least 1".into()));
        }
        Ok(())
    }

    /// Parse and validate a JSON settings document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, MemoryError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| MemoryError::Config(format!("invalid retrieval config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON settings file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            MemoryError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&content)
    }
}

/// Model capability tier. Which concrete model backs each tier is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheap, low-latency model for extraction, decisions and queries.
    Fast,
    /// Strongest model, used for summaries and boundary selection.
    Flagship,
}

/// Model names and output caps per tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub fast_model: String,
    pub flagship_model: String,
    pub fast_max_tokens: usize,
    pub flagship_max_tokens: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fast_model: "claude-3-5-haiku-20241022".to_string(),
            flagship_model: "claude-sonnet-4-20250514".to_string(),
            fast_max_tokens: 1024,
            flagship_max_tokens: 2048,
        }
    }
}

impl ModelConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Flagship => &self.flagship_model,
        }
    }

    pub fn max_tokens_for(&self, tier: ModelTier) -> usize {
        match tier {
            ModelTier::Fast => self.fast_max_tokens,
            ModelTier::Flagship => self.flagship_max_tokens,
        }
    }
}

/// Hot-reloadable handle to the current retrieval configuration.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    sender: Arc<watch::Sender<Arc<RetrievalConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: RetrievalConfig) -> Self {
        let (sender, _) = watch::channel(Arc::new(config));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// The configuration as of now. Later updates do not affect the snapshot.
    pub fn snapshot(&self) -> Arc<RetrievalConfig> {
        Arc::clone(&self.sender.borrow())
    }

    /// Replace the configuration after validating it.
    pub fn update(&self, config: RetrievalConfig) -> Result<(), MemoryError> {
        config.validate()?;
        self.sender.send_replace(Arc::new(config));
        tracing::info!("retrieval config reloaded");
        Ok(())
    }

    /// Watch for configuration changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RetrievalConfig>> {
        self.sender.subscribe()
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(RetrievalConfig::default())
    }
}
