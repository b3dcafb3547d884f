// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod codec;
pub mod config;
pub mod queue;
pub mod store;
pub mod types;

pub use config::{AgentConfig, ConfigError};
pub use queue::BoundedQueue;
pub use store::{StorePolicy, StoreSummary, TaskCounts, TaskStore};
pub use types::{ReportRecord, TaskId, TaskPayload, TaskRecord, TaskState, TaskType};
