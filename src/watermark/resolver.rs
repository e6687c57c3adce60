// ABOUTME: WatermarkResolver - health check, refresh, then top-1 sorted query against the destination
// ABOUTME: Every failure maps to Abort; a missing index or empty result maps to Fresh

use anyhow::Result;
use async_trait::async_trait;

use super::spec::{HealthStatus, IndexName, WatermarkSpec};
use super::ResolvedWatermark;
use crate::destination::request::TopWatermarkQuery;
use crate::error::AbortReason;

/// Whether the refreshed index exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPresence {
    Present,
    Missing,
}

/// Result of the top-1 watermark query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopHit {
    IndexMissing,
    NoHits,
    Value(i64),
}

/// The three destination operations the resolver needs.
///
/// Implemented by `ElasticsearchClient`; tests substitute in-memory fakes.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn health(&self) -> Result<HealthStatus>;

    /// Force recent writes to become visible. Implementations must treat a
    /// partially failed refresh as an error.
    async fn refresh(&self, index: &IndexName) -> Result<IndexPresence>;

    async fn top_watermark(&self, query: &TopWatermarkQuery) -> Result<TopHit>;
}

/// Resolves the current watermark from the destination's own contents.
///
/// Nothing is cached between calls: each `resolve` re-derives progress, so a
/// restart after any failure resumes from whatever the destination holds.
pub struct WatermarkResolver<S> {
    store: S,
    spec: WatermarkSpec,
    min_health: HealthStatus,
    query: TopWatermarkQuery,
}

impl<S: WatermarkStore> WatermarkResolver<S> {
    pub fn new(store: S, spec: WatermarkSpec, min_health: HealthStatus) -> Self {
        let query = TopWatermarkQuery::new(
            spec.index.clone(),
            spec.field.clone(),
            spec.category.clone(),
        );
        Self {
            store,
            spec,
            min_health,
            query,
        }
    }

    pub fn spec(&self) -> &WatermarkSpec {
        &self.spec
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolve the watermark for this cycle.
    ///
    /// The refresh is issued before the query on every call; without it a
    /// document written by the previous cycle may not be searchable yet and
    /// the query would return a lower value.
    pub async fn resolve(&self) -> ResolvedWatermark {
        match self.store.health().await {
            Ok(status) if status >= self.min_health => {
                tracing::debug!("Destination health is {}", status);
            }
            Ok(status) => {
                return ResolvedWatermark::Abort(AbortReason::DestinationDegraded(format!(
                    "cluster status {} is below required {}",
                    status, self.min_health
                )));
            }
            Err(e) => {
                return ResolvedWatermark::Abort(AbortReason::DestinationDegraded(format!(
                    "health check failed: {:#}",
                    e
                )));
            }
        }

        match self.store.refresh(&self.spec.index).await {
            Ok(IndexPresence::Present) => {}
            Ok(IndexPresence::Missing) => {
                tracing::info!(
                    "Index {} does not exist yet, starting from the beginning",
                    self.spec.index
                );
                return ResolvedWatermark::Fresh;
            }
            Err(e) => {
                return ResolvedWatermark::Abort(AbortReason::DestinationRefreshFailed(format!(
                    "{:#}",
                    e
                )));
            }
        }

        match self.store.top_watermark(&self.query).await {
            Ok(TopHit::Value(v)) => ResolvedWatermark::Value(v),
            Ok(TopHit::IndexMissing) => {
                tracing::info!(
                    "Index {} disappeared after refresh, treating as first run",
                    self.spec.index
                );
                ResolvedWatermark::Fresh
            }
            Ok(TopHit::NoHits) => {
                tracing::info!(
                    "No documents with {} in {}, starting from the beginning",
                    self.spec.field,
                    self.spec.index
                );
                ResolvedWatermark::Fresh
            }
            Err(e) => ResolvedWatermark::Abort(AbortReason::Unexpected(format!("{:#}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::spec::{FieldName, IndexName};
    use std::sync::Mutex;

    struct ScriptedStore {
        health: Result<HealthStatus, String>,
        refresh: Result<IndexPresence, String>,
        top: Result<TopHit, String>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedStore {
        fn healthy(top: TopHit) -> Self {
            Self {
                health: Ok(HealthStatus::Green),
                refresh: Ok(IndexPresence::Present),
                top: Ok(top),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WatermarkStore for ScriptedStore {
        async fn health(&self) -> Result<HealthStatus> {
            self.calls.lock().unwrap().push("health");
            self.health.clone().map_err(anyhow::Error::msg)
        }

        async fn refresh(&self, _index: &IndexName) -> Result<IndexPresence> {
            self.calls.lock().unwrap().push("refresh");
            self.refresh.clone().map_err(anyhow::Error::msg)
        }

        async fn top_watermark(&self, _query: &TopWatermarkQuery) -> Result<TopHit> {
            self.calls.lock().unwrap().push("top");
            self.top.clone().map_err(anyhow::Error::msg)
        }
    }

    fn spec() -> WatermarkSpec {
        WatermarkSpec {
            field: FieldName::parse("id").unwrap(),
            index: IndexName::parse("orders").unwrap(),
            category: None,
            endpoint: url::Url::parse("http://localhost:9200").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_resolve_value() {
        let store = ScriptedStore::healthy(TopHit::Value(42));
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        assert_eq!(resolver.resolve().await, ResolvedWatermark::Value(42));
        assert_eq!(resolver.store().calls(), vec!["health", "refresh", "top"]);
    }

    #[tokio::test]
    async fn test_resolve_yellow_is_usable_by_default() {
        let mut store = ScriptedStore::healthy(TopHit::Value(1));
        store.health = Ok(HealthStatus::Yellow);
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        assert_eq!(resolver.resolve().await, ResolvedWatermark::Value(1));
    }

    #[tokio::test]
    async fn test_resolve_degraded_stops_before_refresh() {
        let mut store = ScriptedStore::healthy(TopHit::Value(1));
        store.health = Ok(HealthStatus::Red);
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        let resolved = resolver.resolve().await;
        assert!(matches!(
            resolved,
            ResolvedWatermark::Abort(AbortReason::DestinationDegraded(_))
        ));
        assert_eq!(resolver.store().calls(), vec!["health"]);
    }

    #[tokio::test]
    async fn test_resolve_health_transport_error_is_degraded() {
        let mut store = ScriptedStore::healthy(TopHit::Value(1));
        store.health = Err("connection refused".to_string());
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        match resolver.resolve().await {
            ResolvedWatermark::Abort(AbortReason::DestinationDegraded(msg)) => {
                assert!(msg.contains("connection refused"))
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_refresh_failure_skips_query() {
        let mut store = ScriptedStore::healthy(TopHit::Value(1));
        store.refresh = Err("1 of 5 shards failed".to_string());
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        assert!(matches!(
            resolver.resolve().await,
            ResolvedWatermark::Abort(AbortReason::DestinationRefreshFailed(_))
        ));
        assert_eq!(resolver.store().calls(), vec!["health", "refresh"]);
    }

    #[tokio::test]
    async fn test_resolve_missing_index_is_fresh() {
        let mut store = ScriptedStore::healthy(TopHit::Value(1));
        store.refresh = Ok(IndexPresence::Missing);
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        assert_eq!(resolver.resolve().await, ResolvedWatermark::Fresh);
        assert_eq!(resolver.store().calls(), vec!["health", "refresh"]);
    }

    #[tokio::test]
    async fn test_resolve_no_hits_is_fresh() {
        let store = ScriptedStore::healthy(TopHit::NoHits);
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        assert_eq!(resolver.resolve().await, ResolvedWatermark::Fresh);
    }

    #[tokio::test]
    async fn test_resolve_malformed_response_aborts() {
        let mut store = ScriptedStore::healthy(TopHit::NoHits);
        store.top = Err("watermark is not an integer".to_string());
        let resolver = WatermarkResolver::new(store, spec(), HealthStatus::Yellow);
        assert!(matches!(
            resolver.resolve().await,
            ResolvedWatermark::Abort(AbortReason::Unexpected(_))
        ));
    }
}
