//! The values flowing into and out of memoized functions.
//!
//! Memoized functions take an ordered list of [`Value`]s as arguments and produce a
//! [`ResultTuple`], which conventionally starts with an error (or `null`) followed by any number
//! of result values.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Number;

/// A plain data value that can be passed to or returned from a memoized function.
///
/// Besides JSON-like data, this can hold [dates](Value::Date) and [errors](Value::Error), both of
/// which survive a trip through the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// A UTC timestamp.
    ///
    /// Only millisecond precision survives the cache, [`Value::date`] truncates accordingly.
    /// Dates outside the years 0 to 9999 are returned from the cache as strings.
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Error(Box<ErrorValue>),
}

impl Value {
    /// Creates a [`Value::Date`], truncating the timestamp to millisecond precision.
    pub fn date(date: DateTime<Utc>) -> Self {
        Self::Date(date.trunc_subsecs(3))
    }

    /// Creates a [`Value::Object`] from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

/// Non-finite floats have no JSON representation and become [`Value::Null`].
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Self::date(date)
    }
}

impl From<ErrorValue> for Value {
    fn from(error: ErrorValue) -> Self {
        Self::Error(Box::new(error))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// An error produced by a memoized function.
///
/// Only the fields listed here are carried through the cache, anything else an error might
/// have known about is lost when it is stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorValue {
    pub message: String,
    pub name: Option<String>,
    /// A free-form classification of the error, such as an error code.
    pub kind: Option<String>,
    pub stack: Option<String>,
    pub arguments: Option<Value>,
}

impl ErrorValue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<Value>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(ref name) => write!(f, "{name}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ErrorValue {}

/// The ordered list of values a computation completed with.
///
/// This is the unit that is stored in, and retrieved from, the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTuple(Vec<Value>);

impl ResultTuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// A successful result: `null` followed by the given values.
    pub fn ok<I: IntoIterator<Item = Value>>(values: I) -> Self {
        Self(std::iter::once(Value::Null).chain(values).collect())
    }

    /// A failed result carrying only the given error.
    pub fn err(error: ErrorValue) -> Self {
        Self(vec![error.into()])
    }

    /// Returns the error if the first element of this tuple is one.
    pub fn error(&self) -> Option<&ErrorValue> {
        self.0.first().and_then(Value::as_error)
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for ResultTuple {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
