// ABOUTME: Structured Elasticsearch request bodies and response parsing for watermark lookup
// ABOUTME: Field references are typed identifiers serialized through serde_json, never concatenated

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};

use crate::watermark::spec::{Category, FieldName, HealthStatus, IndexName};
use crate::watermark::TopHit;

/// "Match all documents of this category, sort by the watermark field
/// descending, return one."
#[derive(Debug, Clone, PartialEq)]
pub struct TopWatermarkQuery {
    pub index: IndexName,
    pub field: FieldName,
    pub category: Option<Category>,
}

impl TopWatermarkQuery {
    pub fn new(index: IndexName, field: FieldName, category: Option<Category>) -> Self {
        Self {
            index,
            field,
            category,
        }
    }

    /// Build the `_search` request body.
    ///
    /// `unmapped_type` keeps the sort valid on an index that exists but has
    /// never seen the watermark field.
    pub fn to_body(&self) -> Value {
        let query = match &self.category {
            Some(category) => json!({
                "bool": {
                    "filter": [
                        { "term": { category.field.as_str(): category.value } }
                    ]
                }
            }),
            None => json!({ "match_all": {} }),
        };

        json!({
            "size": 1,
            "query": query,
            "sort": [
                { self.field.as_str(): { "order": "desc", "unmapped_type": "long" } }
            ],
            "_source": [self.field.as_str()],
        })
    }

    /// Interpret a successful `_search` response.
    pub fn parse_response(&self, body: &Value) -> Result<TopHit> {
        let hits = body
            .get("hits")
            .and_then(|h| h.get("hits"))
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("search response has no hits.hits array"))?;

        let Some(top) = hits.first() else {
            return Ok(TopHit::NoHits);
        };

        // Prefer the sort value, which is what the server actually ordered by.
        // A document without the field sorts with i64::MIN under a descending
        // sort, so that value falls through to `_source`.
        if let Some(sort_value) = top
            .get("sort")
            .and_then(Value::as_array)
            .and_then(|s| s.first())
            .filter(|v| !is_missing_sort_value(v))
        {
            return watermark_from_json(sort_value)
                .with_context(|| format!("invalid sort value for {}", self.field))
                .map(TopHit::Value);
        }

        let source_value = top
            .get("_source")
            .and_then(|source| lookup_path(source, &self.field))
            .filter(|v| !v.is_null());

        match source_value {
            Some(v) => watermark_from_json(v)
                .with_context(|| format!("invalid value for {} in top document", self.field))
                .map(TopHit::Value),
            // The top document lacks the field entirely: nothing indexed has a watermark.
            None => Ok(TopHit::NoHits),
        }
    }
}

fn is_missing_sort_value(value: &Value) -> bool {
    value.is_null() || value.as_i64() == Some(i64::MIN)
}

/// Follow a dotted field path through nested objects. A literal key
/// containing dots (flattened mapping) is also accepted.
pub fn lookup_path<'a>(source: &'a Value, field: &FieldName) -> Option<&'a Value> {
    if let Some(v) = source.get(field.as_str()) {
        return Some(v);
    }
    field
        .segments()
        .try_fold(source, |current, segment| current.get(segment))
}

/// Convert a JSON value to a watermark.
///
/// Accepts integers, floats with no fractional part (date fields come back as
/// epoch millis) and strings holding an integer.
pub fn watermark_from_json(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                // i64::MAX as f64 rounds up to 2^63, which is already out of range
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    Ok(f as i64)
                }
                _ => bail!("{} is not an integer watermark", n),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .with_context(|| format!("`{}` is not an integer watermark", s)),
        other => bail!("unsupported watermark value {}", other),
    }
}

/// Extract the cluster status from a `_cluster/health` response.
pub fn parse_health(body: &Value) -> Result<HealthStatus> {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("health response has no status"))?;
    status.parse::<HealthStatus>().map_err(|e| anyhow!(e))
}

/// Check a `_refresh` response for shard failures.
pub fn check_refresh(body: &Value) -> Result<()> {
    let failed = body
        .get("_shards")
        .and_then(|s| s.get("failed"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if failed > 0 {
        let total = body
            .get("_shards")
            .and_then(|s| s.get("total"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        bail!("{} of {} shards failed to refresh", failed, total);
    }
    Ok(())
}

/// Whether an error body reports a missing index.
pub fn is_index_not_found(body: &Value) -> bool {
    body.get("error")
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .map(|t| t == "index_not_found_exception")
        .unwrap_or(false)
}
