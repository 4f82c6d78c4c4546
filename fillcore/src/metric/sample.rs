// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use serde::{Deserialize, Serialize};

use crate::metric::labels::Labels;
use crate::metric::metric_point::MetricPoint;

/// A single finalized observation: the series labels plus one point.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Sample {
  labels: Labels,
  time: i64,
  value: f64,
}

impl Sample {
  pub fn new(labels: Labels, time: i64, value: f64) -> Self {
    Sample {
      labels,
      time,
      value,
    }
  }

  pub fn get_labels(&self) -> &Labels {
    &self.labels
  }

  pub fn get_labels_mut(&mut self) -> &mut Labels {
    &mut self.labels
  }

  /// Take ownership of the labels, consuming the sample.
  pub fn into_labels(self) -> Labels {
    self.labels
  }

  pub fn get_time(&self) -> i64 {
    self.time
  }

  pub fn get_value(&self) -> f64 {
    self.value
  }

  pub fn set_value(&mut self, value: f64) {
    self.value = value;
  }

  pub fn set_time(&mut self, time: i64) {
    self.time = time;
  }

  /// Get the point part of this sample.
  pub fn get_metric_point(&self) -> MetricPoint {
    MetricPoint::new(self.time, self.value)
  }
}
