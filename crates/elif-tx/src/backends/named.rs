//! Named query arguments
//!
//! Write statements take `:name` style parameters. Before reaching the
//! driver they are rewritten into the dialect's positional placeholders.

use serde::Serialize;
use serde_json::Value as JsonValue;

use super::core::{DatabaseValue, SqlDialect};
use crate::error::{TxError, TxResult};

/// Ordered set of named query arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedArgs {
    values: Vec<(String, DatabaseValue)>,
}

impl NamedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `value` to `:name`, replacing an earlier binding of the same name
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<DatabaseValue>) {
        let name = name.into();
        let value = value.into();
        match self.values.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    /// Build arguments from the fields of a serializable struct or map
    pub fn from_serialize<T: Serialize>(value: &T) -> TxResult<Self> {
        match serde_json::to_value(value)? {
            JsonValue::Object(fields) => Ok(fields
                .into_iter()
                .fold(Self::new(), |args, (name, field)| {
                    args.bind(name, DatabaseValue::from_json(field))
                })),
            other => Err(TxError::Binding(format!(
                "named arguments need a struct or map, got {}",
                other
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<&DatabaseValue> {
        self.values
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Rewrite `:name` parameters into positional placeholders.
///
/// `::type` casts and text inside single-quoted literals are left alone. A
/// name used twice is bound twice.
pub fn expand(sql: &str, args: &NamedArgs, dialect: SqlDialect) -> TxResult<(String, Vec<DatabaseValue>)> {
    let mut rendered = String::with_capacity(sql.len());
    let mut params = Vec::new();
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
            rendered.push(c);
            continue;
        }
        if c != ':' || in_literal {
            rendered.push(c);
            continue;
        }

        match chars.peek() {
            Some(':') => {
                rendered.push_str("::");
                chars.next();
            }
            Some(&next) if next.is_ascii_alphabetic() || next == '_' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '_') {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                let value = args
                    .get(&name)
                    .ok_or_else(|| TxError::Binding(format!("missing named argument ':{}'", name)))?;
                rendered.push_str(&dialect.parameter_placeholder(params.len()));
                params.push(value.clone());
            }
            _ => rendered.push(c),
        }
    }

    Ok((rendered, params))
}
