//! Session and long-term conversation memory with auto-pruning, plus the
//! performance metrics ledger.

mod manager;
mod metrics;
mod schema;

pub use manager::{MemoryManager, MemoryParams, MemoryStats, SessionMetadata};
pub use metrics::{MetricsTracker, PerformanceMetrics};
pub use schema::{AttemptRecord, FeedbackRecord, Interaction, ReasoningStepRecord};
