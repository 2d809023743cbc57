//! Sync-and-cache pipeline over a chat platform's message history.

pub mod config;
pub mod fingerprint;
pub mod orchestrator;
pub mod summary_cache;
pub mod sync_state;
pub mod window;

pub use config::PipelineConfig;
pub use fingerprint::fingerprint;
pub use orchestrator::{Collaborators, SyncOrchestrator};
pub use summary_cache::{CachedSummary, GenerationTarget, SummaryCache};
pub use sync_state::{SyncState, SyncStateTracker, SyncStatus};
pub use window::{ActivityIndex, ActivitySnapshot};
