// ABOUTME: Library root for watermark-sync - stateless incremental sync from PostgreSQL to a search index
// ABOUTME: Progress is re-derived from the destination every cycle; nothing is persisted locally

pub mod config;
pub mod destination;
pub mod emit;
pub mod error;
pub mod source;
pub mod sync;
pub mod utils;
pub mod watermark;

pub use config::{SyncConfig, ValidatedConfig};
pub use error::{AbortReason, ConfigError, CycleError};
pub use sync::{CycleScheduler, SyncCycle};
pub use watermark::{ResolvedWatermark, WatermarkResolver};
