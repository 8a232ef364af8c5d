//! Core types for ReportDB

use crate::query::QueryData;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix timestamp in seconds
pub type Timestamp = u32;

/// Object (polled device) identifier
pub type ObjectId = u32;

/// Counter (metric) identifier
pub type CounterId = u16;

/// Declared value type of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint64,
    Float64,
    String,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Uint64 => "uint64",
            DataType::Float64 => "float64",
            DataType::String => "string",
        }
    }

    /// Whether numeric aggregators apply
    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A raw sample value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    U64(u64),
    F64(f64),
    Str(String),
}

impl Value {
    /// Numeric view; strings are not convertible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::U64(v) => Some(*v as f64),
            Value::F64(v) => Some(*v),
            Value::Str(_) => None,
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// A single raw sample produced by the poller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub object_id: ObjectId,
    pub counter_id: CounterId,
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Event {
    pub fn new(object_id: ObjectId, counter_id: CounterId, timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            object_id,
            counter_id,
            timestamp,
            value: value.into(),
        }
    }
}

/// Decoded, queryable sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl DataPoint {
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// Inclusive time range in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

fn default_inclusive_end() -> bool {
    true
}

/// Range query over one counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub counter_id: CounterId,
    /// Empty means every object present in the range
    #[serde(default)]
    pub object_ids: Vec<ObjectId>,
    pub from: Timestamp,
    pub to: Timestamp,
    #[serde(default)]
    pub aggregation: String,
    #[serde(default)]
    pub group_by_objects: bool,
    /// Histogram bucket width in seconds, 0 disables bucketing
    #[serde(default)]
    pub interval: u32,
    /// Include samples at exactly `to` when bucketing
    #[serde(default = "default_inclusive_end")]
    pub inclusive_end: bool,
}

impl Query {
    pub fn new(counter_id: CounterId, from: Timestamp, to: Timestamp) -> Self {
        Self {
            counter_id,
            object_ids: Vec::new(),
            from,
            to,
            aggregation: String::new(),
            group_by_objects: false,
            interval: 0,
            inclusive_end: true,
        }
    }

    pub fn with_objects(mut self, object_ids: impl Into<Vec<ObjectId>>) -> Self {
        self.object_ids = object_ids.into();
        self
    }

    pub fn with_aggregation(mut self, aggregation: impl Into<String>) -> Self {
        self.aggregation = aggregation.into();
        self
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn grouped(mut self, group_by_objects: bool) -> Self {
        self.group_by_objects = group_by_objects;
        self
    }

    pub fn with_inclusive_end(mut self, inclusive_end: bool) -> Self {
        self.inclusive_end = inclusive_end;
        self
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.from, self.to)
    }
}

/// Query envelope as delivered by the query transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryReceive {
    pub request_id: u64,
    #[serde(rename = "query_request")]
    pub query: Query,
}

/// Exactly one of `data` / `error` is meaningful
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub request_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub data: Option<QueryData>,
}

impl Response {
    pub fn ok(request_id: u64, data: QueryData) -> Self {
        Self {
            request_id,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(request_id: u64, error: impl fmt::Display) -> Self {
        Self {
            request_id,
            error: Some(error.to_string()),
            data: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
