// ABOUTME: Source module - binds the watermark into the statement and streams rows from PostgreSQL
// ABOUTME: Rows are ordered column/value lists handed one at a time to the emitter

pub mod binder;
pub mod convert;
pub mod executor;

pub use binder::{
    BoundParam, BoundQuery, ParamValue, QueryBinder, QueryTemplate, WATERMARK_PARAMETER,
};
pub use executor::{PostgresSource, RowSource, RowStream, SourceOptions};

use serde_json::Value as JsonValue;

/// One result record: column names mapped to scalar JSON values, in select order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<(String, JsonValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, JsonValue)>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[(String, JsonValue)] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn into_columns(self) -> Vec<(String, JsonValue)> {
        self.columns
    }
}

impl FromIterator<(String, JsonValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
