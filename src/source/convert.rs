// ABOUTME: PostgreSQL row to ordered JSON row conversion
// ABOUTME: Maps column types to JSON scalars; bytea is base64-encoded, numeric becomes a number

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Number, Value as JsonValue};
use tokio_postgres::types::Type;

use super::Row;

/// Convert a `tokio_postgres::Row` into a `Row`, keeping column order.
pub fn pg_row_to_row(row: &tokio_postgres::Row, lowercase_column_names: bool) -> Row {
    let columns = row
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let name = if lowercase_column_names {
                column.name().to_lowercase()
            } else {
                column.name().to_string()
            };
            (name, column_to_json(row, idx, column.type_()))
        })
        .collect();
    Row::new(columns)
}

fn column_to_json(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> JsonValue {
    match *ty {
        Type::BOOL => opt(row.try_get::<_, Option<bool>>(idx), JsonValue::Bool),
        Type::INT2 => opt(row.try_get::<_, Option<i16>>(idx), |v| JsonValue::from(v)),
        Type::INT4 => opt(row.try_get::<_, Option<i32>>(idx), |v| JsonValue::from(v)),
        Type::INT8 => opt(row.try_get::<_, Option<i64>>(idx), |v| JsonValue::from(v)),
        Type::OID => opt(row.try_get::<_, Option<u32>>(idx), |v| JsonValue::from(v)),
        Type::FLOAT4 => opt(row.try_get::<_, Option<f32>>(idx), |v| float_to_json(v as f64)),
        Type::FLOAT8 => opt(row.try_get::<_, Option<f64>>(idx), float_to_json),
        Type::NUMERIC => opt(row.try_get::<_, Option<Decimal>>(idx), decimal_to_json),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            opt(row.try_get::<_, Option<String>>(idx), JsonValue::String)
        }
        Type::JSON | Type::JSONB => opt(row.try_get::<_, Option<JsonValue>>(idx), |v| v),
        Type::TIMESTAMP => opt(
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx),
            |v| JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        ),
        Type::TIMESTAMPTZ => opt(
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx),
            |v| JsonValue::String(v.to_rfc3339()),
        ),
        Type::DATE => opt(row.try_get::<_, Option<chrono::NaiveDate>>(idx), |v| {
            JsonValue::String(v.to_string())
        }),
        Type::UUID => opt(row.try_get::<_, Option<uuid::Uuid>>(idx), |v| {
            JsonValue::String(v.to_string())
        }),
        Type::BYTEA => opt(row.try_get::<_, Option<Vec<u8>>>(idx), |v| bytes_to_json(&v)),
        _ => {
            // For unknown types, try to get as string
            match row.try_get::<_, Option<String>>(idx) {
                Ok(Some(s)) => JsonValue::String(s),
                Ok(None) => JsonValue::Null,
                Err(_) => {
                    tracing::debug!(
                        "Column {} has unsupported type {}, emitting null",
                        idx,
                        ty
                    );
                    JsonValue::Null
                }
            }
        }
    }
}

fn opt<T>(
    value: Result<Option<T>, tokio_postgres::Error>,
    convert: impl FnOnce(T) -> JsonValue,
) -> JsonValue {
    match value {
        Ok(Some(v)) => convert(v),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::debug!("Failed to decode column value: {}", e);
            JsonValue::Null
        }
    }
}

/// JSON has no NaN or Infinity; those are stored as strings.
pub fn float_to_json(f: f64) -> JsonValue {
    Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(f.to_string()))
}

/// Integral numerics stay exact as JSON integers; the rest go through f64.
pub fn decimal_to_json(d: Decimal) -> JsonValue {
    if d.fract().is_zero() {
        if let Some(i) = d.to_i64() {
            return JsonValue::from(i);
        }
    }
    match d.to_f64() {
        Some(f) if f.is_finite() => float_to_json(f),
        _ => JsonValue::String(d.to_string()),
    }
}

/// Encode binary data as `{"_type": "bytea", "data": "<base64>"}` so it can be
/// told apart from ordinary strings.
pub fn bytes_to_json(bytes: &[u8]) -> JsonValue {
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
    serde_json::json!({
        "_type": "bytea",
        "data": encoded
    })
}
