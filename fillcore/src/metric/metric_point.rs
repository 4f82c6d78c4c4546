// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use approx::abs_diff_eq;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Represents a metric point in time series.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MetricPoint {
  /// Timestamp from epoch, in milliseconds.
  time: i64,

  /// Value for this metric point.
  value: f64,
}

impl MetricPoint {
  /// Create a new MetricPoint from given time and value.
  pub fn new(time: i64, value: f64) -> Self {
    MetricPoint { time, value }
  }

  /// Create a new MetricPoint from given tsz::DataPoint.
  pub fn new_from_tsz_metric_point(tsz_metric_point: tsz::DataPoint) -> Self {
    MetricPoint {
      time: tsz_metric_point.get_time() as i64,
      value: tsz_metric_point.get_value(),
    }
  }

  /// Get time.
  pub fn get_time(&self) -> i64 {
    self.time
  }

  /// Get value.
  pub fn get_value(&self) -> f64 {
    self.value
  }

  /// Set value.
  pub fn set_value(&mut self, value: f64) {
    self.value = value;
  }

  /// Get tsz::DataPoint corresponding to this MetricPoint. Callers make sure the time is not
  /// negative.
  pub fn get_tsz_metric_point(&self) -> tsz::DataPoint {
    tsz::DataPoint::new(self.time as u64, self.value)
  }
}

impl PartialEq for MetricPoint {
  #[inline]
  fn eq(&self, other: &MetricPoint) -> bool {
    // Two metric points are equal if their times are equal, and their values are either equal
    // or are NaN.
    if self.time == other.time {
      if self.value.is_nan() {
        return other.value.is_nan();
      } else {
        return abs_diff_eq!(self.value, other.value);
      }
    }
    false
  }
}

impl Eq for MetricPoint {}

impl Ord for MetricPoint {
  fn cmp(&self, other: &Self) -> Ordering {
    self.time.cmp(&other.time)
  }
}

impl PartialOrd for MetricPoint {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Hash for MetricPoint {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.time.hash(state);
    // Hash the IEEE754 bit representation of the value.
    self.value.to_bits().hash(state);
  }
}
