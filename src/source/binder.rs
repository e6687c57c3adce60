// ABOUTME: QueryBinder - compiles named :placeholders into native $n parameters and binds values
// ABOUTME: The reserved :sql_last_value slot receives the resolved watermark on every cycle

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio_postgres::types::{ToSql, Type};

use crate::error::{BindError, ConfigError};
use crate::watermark::ResolvedWatermark;

/// Placeholder name reserved for the resolved watermark.
pub const WATERMARK_PARAMETER: &str = "sql_last_value";

/// A configured statement parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Declared protocol type, sent with the prepare so the server never has
    /// to guess from context.
    pub fn pg_type(&self) -> Type {
        match self {
            ParamValue::Bool(_) => Type::BOOL,
            ParamValue::Int(_) => Type::INT8,
            ParamValue::Float(_) => Type::FLOAT8,
            ParamValue::Text(_) => Type::TEXT,
        }
    }

    pub fn boxed(&self) -> Box<dyn ToSql + Sync + Send> {
        match self {
            ParamValue::Bool(v) => Box::new(*v),
            ParamValue::Int(v) => Box::new(*v),
            ParamValue::Float(v) => Box::new(*v),
            ParamValue::Text(v) => Box::new(v.clone()),
        }
    }
}

/// A statement with named placeholders rewritten to `$1..$n`.
///
/// `slots[k]` is the parameter name bound to `$k+1`. A name used several
/// times shares one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    sql: String,
    slots: Vec<String>,
}

impl QueryTemplate {
    /// Compile a statement written with `:name` placeholders.
    ///
    /// Quoted strings, quoted identifiers, dollar-quoted bodies, comments and
    /// `::` casts pass through untouched.
    pub fn compile(statement: &str) -> Result<Self, ConfigError> {
        if statement.trim().is_empty() {
            return Err(ConfigError::EmptyStatement);
        }

        let chars: Vec<char> = statement.chars().collect();
        let mut sql = String::with_capacity(statement.len() + 8);
        let mut slots: Vec<String> = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };

            match c {
                '\'' => {
                    let escapes = matches!(prev, Some('E') | Some('e'))
                        && !(i >= 2 && is_ident_char(chars[i - 2]));
                    let end = quoted_end(&chars, i, '\'', escapes)
                        .ok_or(ConfigError::Unterminated("string literal"))?;
                    let literal: String = chars[i..=end].iter().collect();
                    if mentions_placeholder(&literal, WATERMARK_PARAMETER) {
                        return Err(ConfigError::QuotedReservedPlaceholder(
                            WATERMARK_PARAMETER.to_string(),
                        ));
                    }
                    sql.push_str(&literal);
                    i = end + 1;
                }
                '"' => {
                    let end = quoted_end(&chars, i, '"', false)
                        .ok_or(ConfigError::Unterminated("quoted identifier"))?;
                    sql.extend(&chars[i..=end]);
                    i = end + 1;
                }
                '-' if next == Some('-') => {
                    let end = chars[i..]
                        .iter()
                        .position(|&ch| ch == '\n')
                        .map(|p| i + p)
                        .unwrap_or(chars.len() - 1);
                    sql.extend(&chars[i..=end]);
                    i = end + 1;
                }
                '/' if next == Some('*') => {
                    let end = find_seq(&chars, i + 2, &['*', '/'])
                        .ok_or(ConfigError::Unterminated("block comment"))?;
                    sql.extend(&chars[i..end + 2]);
                    i = end + 2;
                }
                '$' if next.is_some_and(|ch| ch.is_ascii_digit())
                    && !prev.is_some_and(is_ident_char) =>
                {
                    let digits: String = chars[i + 1..]
                        .iter()
                        .take_while(|ch| ch.is_ascii_digit())
                        .collect();
                    return Err(ConfigError::PositionalPlaceholder(digits));
                }
                '$' if !prev.is_some_and(is_ident_char) => match dollar_tag(&chars, i) {
                    Some(tag) => {
                        let body_start = i + tag.len();
                        let close = find_seq(&chars, body_start, &tag)
                            .ok_or(ConfigError::Unterminated("dollar-quoted string"))?;
                        let end = close + tag.len();
                        sql.extend(&chars[i..end]);
                        i = end;
                    }
                    None => {
                        sql.push(c);
                        i += 1;
                    }
                },
                ':' if next == Some(':') => {
                    sql.push_str("::");
                    i += 2;
                }
                ':' if next.is_some_and(is_ident_start) => {
                    let name: String = chars[i + 1..]
                        .iter()
                        .take_while(|&&ch| is_ident_char(ch))
                        .collect();
                    let index = match slots.iter().position(|s| *s == name) {
                        Some(p) => p + 1,
                        None => {
                            slots.push(name.clone());
                            slots.len()
                        }
                    };
                    sql.push('$');
                    sql.push_str(&index.to_string());
                    i += 1 + name.chars().count();
                }
                _ => {
                    sql.push(c);
                    i += 1;
                }
            }
        }

        Ok(Self { sql, slots })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }

    pub fn references_watermark(&self) -> bool {
        self.slots.iter().any(|s| s == WATERMARK_PARAMETER)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Index of the closing quote for a quoted run starting at `start`.
/// A doubled quote is an escaped quote.
fn quoted_end(chars: &[char], start: usize, quote: char, backslash_escapes: bool) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if backslash_escapes && c == '\\' {
            i += 2;
            continue;
        }
        if c == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

fn find_seq(chars: &[char], from: usize, needle: &[char]) -> Option<usize> {
    if needle.is_empty() || from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// The `$tag$` opening a dollar-quoted string at `start`, if any.
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'$') {
        return Some(vec!['$', '$']);
    }
    if !chars.get(i).copied().is_some_and(is_ident_start) {
        return None;
    }
    while i < chars.len() && is_ident_char(chars[i]) {
        i += 1;
    }
    if chars.get(i) == Some(&'$') {
        Some(chars[start..=i].to_vec())
    } else {
        None
    }
}

fn mentions_placeholder(text: &str, name: &str) -> bool {
    let needle = format!(":{}", name);
    text.match_indices(&needle).any(|(pos, _)| {
        let before_ok = pos == 0 || !text[..pos].ends_with(':');
        let after_ok = text[pos + needle.len()..]
            .chars()
            .next()
            .map_or(true, |c| !is_ident_char(c));
        before_ok && after_ok
    })
}

/// One bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub name: String,
    pub value: ParamValue,
}

/// A statement ready to execute: compiled SQL plus values in slot order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    sql: String,
    params: Vec<BoundParam>,
    watermark: i64,
}

impl BoundQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[BoundParam] {
        &self.params
    }

    /// Watermark value this execution was bound with.
    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn types(&self) -> Vec<Type> {
        self.params.iter().map(|p| p.value.pg_type()).collect()
    }

    pub fn values(&self) -> Vec<Box<dyn ToSql + Sync + Send>> {
        self.params.iter().map(|p| p.value.boxed()).collect()
    }
}

/// Binds the resolved watermark and configured parameters into a template.
#[derive(Debug, Clone)]
pub struct QueryBinder {
    template: QueryTemplate,
    parameters: BTreeMap<String, ParamValue>,
    initial_watermark: i64,
}

impl QueryBinder {
    /// Validate the template against the configured parameters.
    pub fn new(
        template: QueryTemplate,
        parameters: BTreeMap<String, ParamValue>,
        initial_watermark: i64,
    ) -> Result<Self, ConfigError> {
        if parameters.contains_key(WATERMARK_PARAMETER) {
            return Err(ConfigError::ReservedParameter(
                WATERMARK_PARAMETER.to_string(),
            ));
        }

        for slot in template.slots() {
            if slot != WATERMARK_PARAMETER && !parameters.contains_key(slot) {
                return Err(ConfigError::UnknownParameter(slot.clone()));
            }
        }

        let used: BTreeSet<&str> = template.slots().iter().map(String::as_str).collect();
        for name in parameters.keys() {
            if !used.contains(name.as_str()) {
                tracing::warn!(
                    "Parameter `{}` is configured but never used in the statement",
                    name
                );
            }
        }

        if !template.references_watermark() {
            tracing::warn!(
                "Statement does not reference :{}; every cycle will re-read the full result",
                WATERMARK_PARAMETER
            );
        }

        Ok(Self {
            template,
            parameters,
            initial_watermark,
        })
    }

    pub fn template(&self) -> &QueryTemplate {
        &self.template
    }

    /// Produce the executable statement for this cycle.
    pub fn bind(&self, watermark: &ResolvedWatermark) -> Result<BoundQuery, BindError> {
        let value = watermark
            .bind_value(self.initial_watermark)
            .ok_or(BindError::Aborted)?;

        let params = self
            .template
            .slots()
            .iter()
            .map(|name| {
                let value = if name == WATERMARK_PARAMETER {
                    ParamValue::Int(value)
                } else {
                    // Presence checked in `new`.
                    self.parameters
                        .get(name)
                        .cloned()
                        .unwrap_or(ParamValue::Int(value))
                };
                BoundParam {
                    name: name.clone(),
                    value,
                }
            })
            .collect();

        Ok(BoundQuery {
            sql: self.template.sql().to_string(),
            params,
            watermark: value,
        })
    }
}
