// ABOUTME: In-memory destination, source and sink used by the cycle and scheduler tests
// ABOUTME: The fake sink writes into the fake destination so resolution sees earlier cycles

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use url::Url;

use watermark_sync::destination::request::{lookup_path, watermark_from_json};
use watermark_sync::destination::TopWatermarkQuery;
use watermark_sync::emit::{Event, EventEmitter, EventSink};
use watermark_sync::error::{SinkError, SourceError};
use watermark_sync::source::{BoundQuery, QueryBinder, QueryTemplate, Row, RowSource, RowStream};
use watermark_sync::sync::SyncCycle;
use watermark_sync::watermark::{
    Category, FieldName, HealthStatus, IndexName, IndexPresence, TopHit, WatermarkResolver,
    WatermarkSpec, WatermarkStore,
};

pub const STATEMENT: &str = "SELECT id, name FROM products WHERE id > :sql_last_value ORDER BY id";

/// Shared state of the fake search index.
#[derive(Debug)]
pub struct DestinationState {
    pub health: HealthStatus,
    pub refresh_fails: bool,
    pub index_exists: bool,
    pub documents: Vec<Value>,
    pub health_calls: usize,
    pub refresh_calls: usize,
    pub search_calls: usize,
}

impl Default for DestinationState {
    fn default() -> Self {
        Self {
            health: HealthStatus::Green,
            refresh_fails: false,
            index_exists: false,
            documents: Vec::new(),
            health_calls: 0,
            refresh_calls: 0,
            search_calls: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeDestination(pub Arc<Mutex<DestinationState>>);

impl FakeDestination {
    pub fn with<T>(&self, f: impl FnOnce(&mut DestinationState) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }

    pub fn document_count(&self) -> usize {
        self.with(|d| d.documents.len())
    }
}

#[async_trait]
impl WatermarkStore for FakeDestination {
    async fn health(&self) -> Result<HealthStatus> {
        Ok(self.with(|d| {
            d.health_calls += 1;
            d.health
        }))
    }

    async fn refresh(&self, _index: &IndexName) -> Result<IndexPresence> {
        self.with(|d| {
            d.refresh_calls += 1;
            if d.refresh_fails {
                bail!("1 of 1 shards failed to refresh");
            }
            Ok(if d.index_exists {
                IndexPresence::Present
            } else {
                IndexPresence::Missing
            })
        })
    }

    async fn top_watermark(&self, query: &TopWatermarkQuery) -> Result<TopHit> {
        self.with(|d| {
            d.search_calls += 1;
            if !d.index_exists {
                return Ok(TopHit::IndexMissing);
            }
            let top = d
                .documents
                .iter()
                .filter(|doc| match &query.category {
                    Some(c) => lookup_path(doc, &c.field) == Some(&json!(c.value)),
                    None => true,
                })
                .filter_map(|doc| lookup_path(doc, &query.field))
                .map(watermark_from_json)
                .collect::<Result<Vec<i64>>>()?
                .into_iter()
                .max();
            Ok(top.map_or(TopHit::NoHits, TopHit::Value))
        })
    }
}

/// Sink that indexes into a `FakeDestination`, optionally rejecting after a
/// number of events.
pub struct FakeSink {
    pub destination: FakeDestination,
    pub category: Option<Category>,
    pub reject_after: Option<usize>,
    accepted: usize,
}

impl FakeSink {
    pub fn new(destination: FakeDestination) -> Self {
        Self {
            destination,
            category: None,
            reject_after: None,
            accepted: 0,
        }
    }
}

#[async_trait]
impl EventSink for FakeSink {
    async fn accept(&mut self, mut event: Event) -> Result<(), SinkError> {
        if self.reject_after == Some(self.accepted) {
            return Err(SinkError("index is read-only".to_string()));
        }
        if let Some(category) = &self.category {
            event.insert(category.field.to_string(), json!(category.value));
        }
        let document = event.into_json();
        self.destination.with(|d| {
            d.index_exists = true;
            d.documents.push(document);
        });
        self.accepted += 1;
        Ok(())
    }
}

/// Source holding an in-memory table of `(id, name)` rows. Executing a
/// bound statement returns the rows with `id > :sql_last_value`.
#[derive(Debug, Clone, Default)]
pub struct FakeSource {
    pub table: Arc<Mutex<Vec<i64>>>,
    pub executed: Arc<Mutex<Vec<i64>>>,
    pub fail_after: Option<usize>,
}

impl FakeSource {
    pub fn with_ids(ids: &[i64]) -> Self {
        Self {
            table: Arc::new(Mutex::new(ids.to_vec())),
            ..Self::default()
        }
    }

    pub fn insert(&self, id: i64) {
        self.table.lock().unwrap().push(id);
    }

    /// Watermarks bound into each executed statement, in order.
    pub fn executed(&self) -> Vec<i64> {
        self.executed.lock().unwrap().clone()
    }
}

pub fn product_row(id: i64) -> Row {
    vec![
        ("id".to_string(), json!(id)),
        ("name".to_string(), json!(format!("product-{}", id))),
    ]
    .into_iter()
    .collect()
}

#[async_trait]
impl RowSource for FakeSource {
    async fn execute<'a>(&'a mut self, query: &BoundQuery) -> Result<RowStream<'a>, SourceError> {
        let watermark = query.watermark();
        self.executed.lock().unwrap().push(watermark);

        let mut ids: Vec<i64> = self
            .table
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|id| *id > watermark)
            .collect();
        ids.sort_unstable();

        let mut items: Vec<Result<Row, SourceError>> =
            ids.into_iter().map(|id| Ok(product_row(id))).collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(SourceError::new("connection reset by peer")));
        }
        Ok(stream::iter(items).boxed())
    }
}

pub fn spec(category: Option<&str>) -> WatermarkSpec {
    WatermarkSpec {
        field: FieldName::parse("id").unwrap(),
        index: IndexName::parse("products").unwrap(),
        category: category.map(|value| Category {
            field: FieldName::parse("type").unwrap(),
            value: value.to_string(),
        }),
        endpoint: Url::parse("http://localhost:9200").unwrap(),
    }
}

pub fn binder(initial_watermark: i64) -> QueryBinder {
    QueryBinder::new(
        QueryTemplate::compile(STATEMENT).unwrap(),
        BTreeMap::new(),
        initial_watermark,
    )
    .unwrap()
}

pub type FakeCycle = SyncCycle<FakeDestination, FakeSource, FakeSink>;

pub fn fake_cycle(destination: &FakeDestination, source: &FakeSource) -> FakeCycle {
    SyncCycle::new(
        WatermarkResolver::new(destination.clone(), spec(None), HealthStatus::Yellow),
        binder(0),
        source.clone(),
        EventEmitter::new(FakeSink::new(destination.clone())),
    )
}
