// ABOUTME: EventEmitter - turns each row into one event and hands it to the downstream sink
// ABOUTME: Delivery is synchronous: a row counts as processed only once the sink accepted it

pub mod sinks;

pub use sinks::{ElasticsearchSink, JsonLinesSink};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue};

use crate::error::SinkError;
use crate::source::Row;

/// Field holding the emission time on every event.
pub const TIMESTAMP_FIELD: &str = "@timestamp";

/// A normalized record ready for the sink. Row columns become fields in
/// order; `@timestamp` is added unless the row already carries one.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    fields: Map<String, JsonValue>,
    emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn from_row(row: Row, emitted_at: DateTime<Utc>) -> Self {
        let mut fields: Map<String, JsonValue> = row.into_columns().into_iter().collect();
        if !fields.contains_key(TIMESTAMP_FIELD) {
            fields.insert(
                TIMESTAMP_FIELD.to_string(),
                JsonValue::String(emitted_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        Self { fields, emitted_at }
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn insert(&mut self, field: String, value: JsonValue) {
        self.fields.insert(field, value);
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.fields)
    }
}

/// Downstream consumer of events. Takes ownership of each event.
#[async_trait]
pub trait EventSink: Send {
    async fn accept(&mut self, event: Event) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: EventSink + ?Sized> EventSink for Box<S> {
    async fn accept(&mut self, event: Event) -> Result<(), SinkError> {
        (**self).accept(event).await
    }
}

/// Converts rows to events, one for one, and delivers them in order.
pub struct EventEmitter<K> {
    sink: K,
}

impl<K: EventSink> EventEmitter<K> {
    pub fn new(sink: K) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Build the event for `row` and wait for the sink to accept it.
    pub async fn emit(&mut self, row: Row) -> Result<(), SinkError> {
        let event = Event::from_row(row, Utc::now());
        self.sink.accept(event).await
    }
}
