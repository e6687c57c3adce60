// ABOUTME: Watermark module - derives sync progress from the destination on every cycle
// ABOUTME: Defines the discriminated resolution result and the resolver against a WatermarkStore

pub mod resolver;
pub mod spec;

pub use resolver::{IndexPresence, TopHit, WatermarkResolver, WatermarkStore};
pub use spec::{Category, FieldName, HealthStatus, IndexName, WatermarkSpec};

use crate::error::AbortReason;

/// Result of resolving the watermark for one cycle.
///
/// Control signals are separate variants, so a legitimate watermark of `0`
/// or `-1` can never be mistaken for "start over" or "skip this cycle".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedWatermark {
    /// Nothing has been indexed yet; start from the source's minimum.
    Fresh,
    /// Highest watermark currently stored in the destination.
    Value(i64),
    /// Do not query the source this cycle.
    Abort(AbortReason),
}

impl ResolvedWatermark {
    pub fn is_abort(&self) -> bool {
        matches!(self, ResolvedWatermark::Abort(_))
    }

    /// The value to bind into the statement, with `Fresh` mapped to `initial`.
    /// Returns `None` for `Abort`.
    pub fn bind_value(&self, initial: i64) -> Option<i64> {
        match self {
            ResolvedWatermark::Fresh => Some(initial),
            ResolvedWatermark::Value(v) => Some(*v),
            ResolvedWatermark::Abort(_) => None,
        }
    }
}
