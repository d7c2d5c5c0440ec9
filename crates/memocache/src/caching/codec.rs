//! Serialization of [`ResultTuple`]s for storage.
//!
//! Tuples are stored as a JSON array. Two kinds of values need special care to survive the trip:
//!
//! - [`Value::Date`] is written as an ISO-8601 UTC timestamp with millisecond precision, such as
//!   `2000-01-01T00:00:00.000Z`. When decoding, *every* string of exactly this shape is revived
//!   into a date. A plain string that happens to look like such a timestamp will thus come back
//!   as a date. Sub-millisecond precision is dropped, and dates outside the years 0 to 9999 do
//!   not fit the shape, so they come back as plain strings.
//! - [`Value::Error`] is written as an object carrying the [`ERROR_TAG`] field set to `true`, and
//!   only the `message`, `name`, `type`, `stack` and `arguments` fields. Objects carrying the tag
//!   are revived into errors.

use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::Map;
use thiserror::Error;

use crate::types::{ErrorValue, ResultTuple, Value};

/// The field marking an encoded object as an error.
pub const ERROR_TAG: &str = "$error";

static DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z$").expect("valid date pattern")
});

/// An error decoding a cached payload.
///
/// The memoization engine treats all of these as a cache miss.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not valid JSON.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The payload is valid JSON, but not an array.
    #[error("payload is not a result tuple")]
    NotATuple,
    /// The payload carries the compression marker but could not be decompressed.
    #[error("corrupt compressed payload: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Serializes a [`ResultTuple`] into JSON bytes.
pub fn encode(tuple: &ResultTuple) -> Vec<u8> {
    to_json_array(tuple.values()).to_string().into_bytes()
}

/// Parses JSON bytes back into a [`ResultTuple`], reviving dates and errors.
pub fn decode(bytes: &[u8]) -> Result<ResultTuple, DecodeError> {
    match serde_json::from_slice(bytes)? {
        serde_json::Value::Array(values) => {
            Ok(ResultTuple::new(values.into_iter().map(from_json).collect()))
        }
        _ => Err(DecodeError::NotATuple),
    }
}

/// Converts a list of values into a JSON array.
///
/// This is also the canonical form arguments are fingerprinted from.
pub(crate) fn to_json_array(values: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(values.iter().map(to_json).collect())
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Date(date) => serde_json::Value::String(format_date(date)),
        Value::Array(values) => to_json_array(values),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), to_json(value)))
                .collect(),
        ),
        Value::Error(error) => error_to_json(error),
    }
}

fn error_to_json(error: &ErrorValue) -> serde_json::Value {
    let mut map = Map::new();
    map.insert(ERROR_TAG.to_owned(), serde_json::Value::Bool(true));
    map.insert(
        "message".to_owned(),
        serde_json::Value::String(error.message.clone()),
    );
    let fields = [
        ("name", &error.name),
        ("type", &error.kind),
        ("stack", &error.stack),
    ];
    for (field, value) in fields {
        if let Some(value) = value {
            map.insert(field.to_owned(), serde_json::Value::String(value.clone()));
        }
    }
    if let Some(ref arguments) = error.arguments {
        map.insert("arguments".to_owned(), to_json(arguments));
    }
    serde_json::Value::Object(map)
}

fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n),
        serde_json::Value::String(s) => match parse_date(&s) {
            Some(date) => Value::Date(date),
            None => Value::String(s),
        },
        serde_json::Value::Array(values) => {
            Value::Array(values.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(map) if is_tagged_error(&map) => error_from_json(map),
        serde_json::Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, from_json(value)))
                .collect(),
        ),
    }
}

fn is_tagged_error(map: &Map<String, serde_json::Value>) -> bool {
    map.get(ERROR_TAG) == Some(&serde_json::Value::Bool(true))
}

fn error_from_json(mut map: Map<String, serde_json::Value>) -> Value {
    let arguments = map.remove("arguments").map(from_json);
    let mut take_string = |field: &str| match map.remove(field) {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    };
    let error = ErrorValue {
        message: take_string("message").unwrap_or_default(),
        name: take_string("name"),
        kind: take_string("type"),
        stack: take_string("stack"),
        arguments,
    };
    error.into()
}

fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if !DATE_PATTERN.is_match(s) {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}
