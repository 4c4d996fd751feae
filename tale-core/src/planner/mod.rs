//! Retrieval planning: deciding what to look up before the narrator answers.
//!
//! Two strategies share the same inputs and output:
//! - [`StaticPlanner`]: one decision call, then parallel chapter queries
//! - [`AgenticPlanner`]: a bounded tool-calling loop
//!
//! Both degrade to `Ok(None)` when the planning call itself fails and only
//! return an error on cancellation.

mod agentic;
mod static_planner;
pub mod tools;

pub use agentic::AgenticPlanner;
pub use static_planner::{PlannedQuery, RetrievalDecision, StaticPlanner};

use crate::config::{PlannerKind, RetrievalConfig};
use crate::index::ChapterIndex;
use crate::query::QueryResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything a planner needs for one user turn.
///
/// The index and config are snapshots taken when the turn started.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub user_turn: &'a str,
    pub index: &'a ChapterIndex,
    pub config: &'a RetrievalConfig,
}

/// Context gathered for the narrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// Answers in the order the queries were issued.
    pub results: Vec<QueryResult>,
    pub retrieved_at: DateTime<Utc>,
    pub strategy: PlannerKind,
    /// Synthesis supplied by the agent when it finished.
    pub summary: Option<String>,
    /// Set when the agent hit its iteration cap before finishing.
    pub partial: bool,
}

impl RetrievedContext {
    pub fn new(strategy: PlannerKind, results: Vec<QueryResult>) -> Self {
        Self {
            results,
            retrieved_at: Utc::now(),
            strategy,
            summary: None,
            partial: false,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results worth citing; explicit "not found" answers are left out.
    pub fn citable(&self) -> impl Iterator<Item = &QueryResult> {
        self.results.iter().filter(|r| !r.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryTarget;

    #[test]
    fn test_citable_skips_not_found() {
        let context = RetrievedContext::new(
            PlannerKind::Static,
            vec![
                QueryResult::new(QueryTarget::Chapter(1), "Who?", "NOT FOUND"),
                QueryResult::new(QueryTarget::Chapter(2), "Who?", "Tobin."),
            ],
        );
        assert_eq!(context.len(), 2);
        let citable: Vec<_> = context.citable().map(|r| r.target).collect();
        assert_eq!(citable, vec![QueryTarget::Chapter(2)]);
    }
}
