//! Entity stores for database operations
//!
//! One store per aggregate, each a unit struct of associated async fns over
//! `&DbPool` (or a generic executor where callers need transactions).

pub mod clusters;
pub mod decisions;
pub mod occurrences;
pub mod queue_jobs;
pub mod repositories;
pub mod runs;
pub mod scores;
pub mod test_cases;

pub use clusters::ClusterStore;
pub use decisions::DecisionStore;
pub use occurrences::OccurrenceStore;
pub use queue_jobs::QueueJobStore;
pub use repositories::{DashboardCounts, RepoStore};
pub use runs::RunStore;
pub use scores::{ScoreStore, ScoredTest};
pub use test_cases::{TestCaseKey, TestCaseStore};
