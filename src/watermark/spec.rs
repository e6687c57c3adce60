// ABOUTME: Typed identifiers describing where the watermark lives in the destination
// ABOUTME: Field and index names are validated once so requests never splice raw strings

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

/// A destination document field, possibly a dotted path into nested objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldName(String);

impl FieldName {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidIdentifier {
            kind: "field name",
            value: value.to_string(),
            reason,
        };

        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '*')
        {
            return Err(invalid("must not contain whitespace, quotes or wildcards"));
        }
        if value.split('.').any(str::is_empty) {
            return Err(invalid("dotted path segments must not be empty"));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments for nested lookup (`a.b.c` -> `["a", "b", "c"]`).
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An Elasticsearch index name.
///
/// Follows the server's own naming rules (lowercase, no path or wildcard
/// characters, no leading `-`, `_` or `+`), which also makes the name safe to
/// use as a single URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexName(String);

impl IndexName {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidIdentifier {
            kind: "index name",
            value: value.to_string(),
            reason,
        };

        if value.is_empty() || value.len() > 255 {
            return Err(invalid("must be 1-255 characters"));
        }
        if value == "." || value == ".." {
            return Err(invalid("must not be `.` or `..`"));
        }
        if value.starts_with(['-', '_', '+']) {
            return Err(invalid("must not start with `-`, `_` or `+`"));
        }
        if value.chars().any(|c| c.is_uppercase()) {
            return Err(invalid("must be lowercase"));
        }
        const FORBIDDEN: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];
        if value.chars().any(|c| FORBIDDEN.contains(&c) || c.is_control()) {
            return Err(invalid("contains a forbidden character"));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Restricts the watermark lookup to documents of one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub field: FieldName,
    pub value: String,
}

/// Destination cluster health, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Red,
    Yellow,
    Green,
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(HealthStatus::Red),
            "yellow" => Ok(HealthStatus::Yellow),
            "green" => Ok(HealthStatus::Green),
            other => Err(format!("unknown health status `{}`", other)),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Red => "red",
            HealthStatus::Yellow => "yellow",
            HealthStatus::Green => "green",
        };
        f.write_str(s)
    }
}

/// What "progress" means for one synchronizer: the highest value of
/// `field` among documents of `category` in `index` at `endpoint`.
#[derive(Debug, Clone)]
pub struct WatermarkSpec {
    pub field: FieldName,
    pub index: IndexName,
    pub category: Option<Category>,
    pub endpoint: Url,
}
