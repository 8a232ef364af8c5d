//! Aggregate function implementations

use crate::Value;
use serde::Serialize;

/// Accumulator for computing aggregates incrementally
pub trait Accumulator: Send {
    /// Add a value to the accumulator
    fn add(&mut self, value: f64);

    /// Get the current result, `None` if nothing was added
    fn result(&self) -> Option<f64>;

    /// Reset the accumulator
    fn reset(&mut self);
}

/// Sum accumulator
#[derive(Debug, Default)]
pub struct SumAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then_some(self.sum)
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Mean accumulator
#[derive(Debug, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Min accumulator
#[derive(Debug, Default)]
pub struct MinAccumulator {
    min: Option<f64>,
}

impl Accumulator for MinAccumulator {
    fn add(&mut self, value: f64) {
        self.min = Some(match self.min {
            Some(current) => current.min(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.min
    }

    fn reset(&mut self) {
        self.min = None;
    }
}

/// Max accumulator
#[derive(Debug, Default)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl Accumulator for MaxAccumulator {
    fn add(&mut self, value: f64) {
        self.max = Some(match self.max {
            Some(current) => current.max(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.max
    }

    fn reset(&mut self) {
        self.max = None;
    }
}

/// Requested aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Sum,
    Count,
    /// Unrecognized name: values pass through untouched
    Raw,
}

impl Aggregation {
    /// Parse case-insensitively; anything unknown (or empty) is `Raw`
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "AVG" | "MEAN" | "AVERAGE" => Aggregation::Avg,
            "MIN" => Aggregation::Min,
            "MAX" => Aggregation::Max,
            "SUM" => Aggregation::Sum,
            "COUNT" => Aggregation::Count,
            _ => Aggregation::Raw,
        }
    }

    /// Aggregation used to merge already-aggregated per-object results;
    /// counts add up, everything else is applied again
    pub fn combining(&self) -> Aggregation {
        match self {
            Aggregation::Count => Aggregation::Sum,
            other => other.clone(),
        }
    }

    fn accumulator(&self) -> Option<Box<dyn Accumulator>> {
        match self {
            Aggregation::Avg => Some(Box::<MeanAccumulator>::default()),
            Aggregation::Min => Some(Box::<MinAccumulator>::default()),
            Aggregation::Max => Some(Box::<MaxAccumulator>::default()),
            Aggregation::Sum => Some(Box::<SumAccumulator>::default()),
            Aggregation::Count | Aggregation::Raw => None,
        }
    }

    /// Aggregate a value list.
    ///
    /// Empty input yields `None`. Numeric aggregators skip strings and report
    /// `0` when nothing numeric remains.
    pub fn apply(&self, values: &[Value]) -> Option<Aggregated> {
        if values.is_empty() {
            return None;
        }
        if let Some(mut acc) = self.accumulator() {
            values.iter().filter_map(Value::as_f64).for_each(|v| acc.add(v));
            return Some(Aggregated::Number(acc.result().unwrap_or(0.0)));
        }
        match self {
            Aggregation::Count => Some(Aggregated::Value(Value::U64(values.len() as u64))),
            _ if values.len() == 1 => Some(Aggregated::Value(values[0].clone())),
            _ => Some(Aggregated::List(values.to_vec())),
        }
    }
}

/// Result of aggregating a value list
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Aggregated {
    Number(f64),
    Value(Value),
    List(Vec<Value>),
}

impl Aggregated {
    /// Flatten back into raw values for a second aggregation pass
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Aggregated::Number(v) => vec![Value::F64(v)],
            Aggregated::Value(v) => vec![v],
            Aggregated::List(vs) => vs,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Aggregated::Number(v) => Some(*v),
            Aggregated::Value(v) => v.as_f64(),
            Aggregated::List(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed() -> Vec<Value> {
        vec![
            Value::U64(10),
            Value::F64(2.5),
            Value::from("down"),
            Value::U64(4),
            Value::F64(-1.5),
        ]
    }

    #[test]
    fn test_mean_accumulator() {
        let mut acc = MeanAccumulator::default();
        acc.add(10.0);
        acc.add(20.0);
        acc.add(30.0);
        assert_eq!(acc.result(), Some(20.0));
        acc.reset();
        assert_eq!(acc.result(), None);
    }

    #[test]
    fn test_min_max_accumulator() {
        let mut min_acc = MinAccumulator::default();
        let mut max_acc = MaxAccumulator::default();

        for v in [5.0, 2.0, 8.0, 1.0, 9.0] {
            min_acc.add(v);
            max_acc.add(v);
        }

        assert_eq!(min_acc.result(), Some(1.0));
        assert_eq!(max_acc.result(), Some(9.0));
    }

    #[test]
    fn test_mixed_values_skip_non_numeric() {
        let values = mixed();
        assert_eq!(Aggregation::Sum.apply(&values), Some(Aggregated::Number(15.0)));
        assert_eq!(Aggregation::Avg.apply(&values), Some(Aggregated::Number(3.75)));
        assert_eq!(Aggregation::Min.apply(&values), Some(Aggregated::Number(-1.5)));
        assert_eq!(Aggregation::Max.apply(&values), Some(Aggregated::Number(10.0)));
        assert_eq!(
            Aggregation::Count.apply(&values),
            Some(Aggregated::Value(Value::U64(5)))
        );
    }

    #[test]
    fn test_empty_input_has_no_aggregate() {
        for agg in [
            Aggregation::Avg,
            Aggregation::Min,
            Aggregation::Max,
            Aggregation::Sum,
            Aggregation::Count,
            Aggregation::Raw,
        ] {
            assert_eq!(agg.apply(&[]), None);
        }
    }

    #[test]
    fn test_only_strings_yield_zero() {
        let values = vec![Value::from("a"), Value::from("b")];
        assert_eq!(Aggregation::Avg.apply(&values), Some(Aggregated::Number(0.0)));
        assert_eq!(Aggregation::Max.apply(&values), Some(Aggregated::Number(0.0)));
    }

    #[test]
    fn test_unknown_aggregation_passes_through() {
        assert_eq!(Aggregation::parse("p99"), Aggregation::Raw);
        assert_eq!(Aggregation::parse(""), Aggregation::Raw);
        assert_eq!(Aggregation::parse("avg"), Aggregation::Avg);

        let one = vec![Value::U64(3)];
        assert_eq!(
            Aggregation::Raw.apply(&one),
            Some(Aggregated::Value(Value::U64(3)))
        );
        let many = mixed();
        assert_eq!(Aggregation::Raw.apply(&many), Some(Aggregated::List(many.clone())));
    }
}
