// ABOUTME: Concrete event sinks - Elasticsearch document indexing and JSON lines on a writer
// ABOUTME: The Elasticsearch sink tags documents with the category so the resolver can find them

use std::io::Write;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{Event, EventSink};
use crate::destination::ElasticsearchClient;
use crate::error::SinkError;
use crate::watermark::spec::{Category, FieldName, IndexName};

/// Indexes each event as one document.
pub struct ElasticsearchSink {
    client: ElasticsearchClient,
    index: IndexName,
    category: Option<Category>,
    document_id_field: Option<FieldName>,
}

impl ElasticsearchSink {
    pub fn new(
        client: ElasticsearchClient,
        index: IndexName,
        category: Option<Category>,
        document_id_field: Option<FieldName>,
    ) -> Self {
        Self {
            client,
            index,
            category,
            document_id_field,
        }
    }

    fn document_id(&self, event: &Event) -> Result<Option<String>, SinkError> {
        let Some(field) = &self.document_id_field else {
            return Ok(None);
        };
        match event.get(field.as_str()) {
            Some(JsonValue::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
            Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
            Some(JsonValue::Bool(b)) => Ok(Some(b.to_string())),
            _ => Err(SinkError(format!(
                "event has no usable value in document id field {}",
                field
            ))),
        }
    }
}

#[async_trait]
impl EventSink for ElasticsearchSink {
    async fn accept(&mut self, mut event: Event) -> Result<(), SinkError> {
        let id = self.document_id(&event)?;
        if let Some(category) = &self.category {
            event.insert(
                category.field.to_string(),
                JsonValue::String(category.value.clone()),
            );
        }
        let document = event.into_json();
        self.client
            .index_document(&self.index, id.as_deref(), &document)
            .await
            .map_err(|e| SinkError(format!("{:#}", e)))
    }
}

/// Writes each event as one JSON object per line.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    async fn accept(&mut self, event: Event) -> Result<(), SinkError> {
        let line = serde_json::to_string(&event.into_json())
            .map_err(|e| SinkError(format!("failed to serialize event: {}", e)))?;
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| SinkError(format!("failed to write event: {}", e)))
    }
}
