//! Query aggregator
//!
//! Turns merged per-object series into the response shape:
//!
//! - string counters: raw points per object
//! - `interval == 0`, grouped: one scalar per object (grid)
//! - `interval == 0`, not grouped: one scalar over all objects (gauge)
//! - `interval > 0`: fixed-width buckets per object, optionally flattened
//!   across objects (histogram)

mod aggregates;

pub use aggregates::*;

use crate::{DataPoint, DataType, ObjectId, Query, ReportError, Result, Timestamp, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Merged series keyed by object
pub type ObjectSeries = BTreeMap<ObjectId, Vec<DataPoint>>;

/// One histogram bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub timestamp: Timestamp,
    pub value: Option<Aggregated>,
}

/// Response payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryData {
    Gauge(Option<Aggregated>),
    Grid(BTreeMap<ObjectId, Option<Aggregated>>),
    Histogram(Vec<SeriesPoint>),
    GroupedHistogram(BTreeMap<ObjectId, Vec<SeriesPoint>>),
    Raw(ObjectSeries),
}

/// Which samples at the range end belong to the last bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketPolicy {
    /// `from <= ts <= to`, buckets start while `start <= to`
    Inclusive,
    /// `from <= ts < to`, buckets start while `start < to`
    HalfOpen,
}

impl BucketPolicy {
    pub fn for_query(query: &Query) -> Self {
        if query.inclusive_end {
            BucketPolicy::Inclusive
        } else {
            BucketPolicy::HalfOpen
        }
    }

    fn admits(&self, ts: Timestamp, from: Timestamp, to: Timestamp) -> bool {
        match self {
            BucketPolicy::Inclusive => ts >= from && ts <= to,
            BucketPolicy::HalfOpen => ts >= from && ts < to,
        }
    }
}

/// Bucket start times covering `[from, to]`
pub fn bucket_starts(interval: u32, from: Timestamp, to: Timestamp, policy: BucketPolicy) -> Vec<Timestamp> {
    let mut starts = Vec::new();
    if interval == 0 || from > to {
        return starts;
    }
    let mut t = from - from % interval;
    while policy.admits(t, t, to) {
        starts.push(t);
        t = match t.checked_add(interval) {
            Some(next) => next,
            None => break,
        };
    }
    starts
}

/// Number of buckets [`bucket_starts`] yields, computed without allocating
pub fn bucket_count(interval: u32, from: Timestamp, to: Timestamp, policy: BucketPolicy) -> u64 {
    if interval == 0 || from > to {
        return 0;
    }
    let interval = u64::from(interval);
    let first = u64::from(from) - u64::from(from) % interval;
    let last = match policy {
        BucketPolicy::Inclusive => u64::from(to),
        BucketPolicy::HalfOpen if u64::from(to) > first => u64::from(to) - 1,
        BucketPolicy::HalfOpen => return 0,
    };
    (last - last % interval - first) / interval + 1
}

/// Aggregate one object's points into fixed-width buckets; empty buckets are 0
pub fn bucket_points(
    points: &[DataPoint],
    interval: u32,
    from: Timestamp,
    to: Timestamp,
    policy: BucketPolicy,
    aggregation: &Aggregation,
) -> Vec<SeriesPoint> {
    let mut buckets: BTreeMap<Timestamp, Vec<Value>> = BTreeMap::new();
    for point in points {
        if !policy.admits(point.timestamp, from, to) {
            continue;
        }
        let start = point.timestamp - point.timestamp % interval;
        buckets.entry(start).or_default().push(point.value.clone());
    }

    bucket_starts(interval, from, to, policy)
        .into_iter()
        .map(|start| SeriesPoint {
            timestamp: start,
            value: match buckets.get(&start) {
                Some(values) => aggregation.apply(values),
                None => Some(Aggregated::Number(0.0)),
            },
        })
        .collect()
}

/// Shapes merged query results
pub struct QueryAggregator;

impl QueryAggregator {
    /// Aggregate merged results according to the query's mode
    pub fn execute(query: &Query, data_type: DataType, results: ObjectSeries) -> Result<QueryData> {
        if results.is_empty() {
            return Err(ReportError::NoDataInRange {
                from: query.from,
                to: query.to,
            });
        }
        if !data_type.is_numeric() {
            return Ok(QueryData::Raw(results));
        }

        let aggregation = Aggregation::parse(&query.aggregation);

        if query.interval == 0 {
            if query.group_by_objects {
                let grid = results
                    .into_iter()
                    .map(|(object, points)| (object, aggregation.apply(&values_of(&points))))
                    .collect();
                return Ok(QueryData::Grid(grid));
            }
            let all: Vec<Value> = results
                .values()
                .flat_map(|points| points.iter().map(|p| p.value.clone()))
                .collect();
            return Ok(QueryData::Gauge(aggregation.apply(&all)));
        }

        let policy = BucketPolicy::for_query(query);
        let bucketed: BTreeMap<ObjectId, Vec<SeriesPoint>> = results
            .into_iter()
            .map(|(object, points)| {
                let series =
                    bucket_points(&points, query.interval, query.from, query.to, policy, &aggregation);
                (object, series)
            })
            .collect();

        if query.group_by_objects {
            return Ok(QueryData::GroupedHistogram(bucketed));
        }

        let combine = aggregation.combining();
        let mut per_bucket: BTreeMap<Timestamp, Vec<Value>> = BTreeMap::new();
        for series in bucketed.into_values() {
            for point in series {
                let values = per_bucket.entry(point.timestamp).or_default();
                if let Some(value) = point.value {
                    values.extend(value.into_values());
                }
            }
        }
        Ok(QueryData::Histogram(
            per_bucket
                .into_iter()
                .map(|(timestamp, values)| SeriesPoint {
                    timestamp,
                    value: combine.apply(&values),
                })
                .collect(),
        ))
    }
}

fn values_of(points: &[DataPoint]) -> Vec<Value> {
    points.iter().map(|p| p.value.clone()).collect()
}
