use crate::{Filter, Value};

/// One `Stats:` expression. Counters carry a filter tree (possibly combined
/// by StatsAnd/StatsOr/StatsNegate), the rest name a numeric column.
#[derive(Debug, Clone)]
pub enum StatsOp {
    Count(Filter),
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    Std(String),
}

impl StatsOp {
    pub fn column(&self) -> Option<&str> {
        match self {
            StatsOp::Count(_) => None,
            StatsOp::Sum(c) | StatsOp::Avg(c) | StatsOp::Min(c) | StatsOp::Max(c)
            | StatsOp::Std(c) => Some(c),
        }
    }

    pub fn new_aggregator(&self) -> StatsAggregator {
        StatsAggregator {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: None,
            max: None,
        }
    }
}

/// Streaming accumulator for a single stats expression. Mergeable so that
/// per-peer partials combine into the final answer.
#[derive(Debug, Clone, Default)]
pub struct StatsAggregator {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl StatsAggregator {
    pub fn add_match(&mut self) {
        self.count += 1;
    }

    pub fn add_value(&mut self, cell: &Value) {
        let v = match cell.as_float() {
            Some(v) => v,
            None => return,
        };
        self.count += 1;
        self.sum += v;
        self.sum_sq += v * v;
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
    }

    pub fn merge(&mut self, other: &StatsAggregator) {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn finalize(&self, op: &StatsOp) -> Value {
        match op {
            StatsOp::Count(_) => Value::Int(self.count as i64),
            StatsOp::Sum(_) => Value::Float(self.sum),
            StatsOp::Avg(_) => {
                if self.count == 0 {
                    Value::Float(0.0)
                } else {
                    Value::Float(self.sum / self.count as f64)
                }
            }
            StatsOp::Min(_) => Value::Float(self.min.unwrap_or(0.0)),
            StatsOp::Max(_) => Value::Float(self.max.unwrap_or(0.0)),
            StatsOp::Std(_) => {
                if self.count == 0 {
                    Value::Float(0.0)
                } else {
                    let mean = self.sum / self.count as f64;
                    let var = (self.sum_sq / self.count as f64 - mean * mean).max(0.0);
                    Value::Float(var.sqrt())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg_over(values: &[f64]) -> StatsAggregator {
        let mut agg = StatsAggregator::default();
        for v in values {
            agg.add_value(&Value::Float(*v));
        }
        agg
    }

    #[test]
    fn aggregates() {
        let agg = agg_over(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(agg.finalize(&StatsOp::Sum("x".into())), Value::Float(10.0));
        assert_eq!(agg.finalize(&StatsOp::Avg("x".into())), Value::Float(2.5));
        assert_eq!(agg.finalize(&StatsOp::Min("x".into())), Value::Float(1.0));
        assert_eq!(agg.finalize(&StatsOp::Max("x".into())), Value::Float(4.0));
        let std = agg.finalize(&StatsOp::Std("x".into())).as_float().unwrap();
        assert!((std - 1.118033988749895).abs() < 1e-12);
    }

    #[test]
    fn merge_equals_single_pass() {
        let mut a = agg_over(&[1.0, 2.0]);
        let b = agg_over(&[3.0, 4.0]);
        a.merge(&b);
        let whole = agg_over(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(a.sum, whole.sum);
        assert_eq!(a.count, whole.count);
        assert_eq!(a.min, whole.min);
        assert_eq!(a.max, whole.max);
    }

    #[test]
    fn empty_aggregator_yields_zeroes() {
        let agg = StatsAggregator::default();
        assert_eq!(agg.finalize(&StatsOp::Avg("x".into())), Value::Float(0.0));
        assert_eq!(agg.finalize(&StatsOp::Std("x".into())), Value::Float(0.0));
    }
}
