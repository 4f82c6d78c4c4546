// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use crate::metric::labels::Labels;
use crate::metric::metric_point::MetricPoint;

/// One series selected by a range selector: its labels and the points that fall inside the
/// selected range, sorted by time.
#[derive(Clone, Debug, PartialEq)]
pub struct PromQLTimeSeries {
  labels: Labels,
  metric_points: Vec<MetricPoint>,
}

// For implementing PromQL range functions on time series

impl PromQLTimeSeries {
  pub fn new(labels: Labels, metric_points: Vec<MetricPoint>) -> Self {
    PromQLTimeSeries {
      labels,
      metric_points,
    }
  }

  /// Gets a reference to the labels associated with the time series.
  pub fn get_labels(&self) -> &Labels {
    &self.labels
  }

  /// Gets a reference to the metric points of the time series.
  pub fn get_metric_points(&self) -> &Vec<MetricPoint> {
    &self.metric_points
  }

  /// Take ownership of the labels, consuming the time series.
  pub fn into_labels(self) -> Labels {
    self.labels
  }

  pub fn is_empty(&self) -> bool {
    self.metric_points.is_empty()
  }

  // **** Functions: https://prometheus.io/docs/prometheus/latest/querying/functions

  /// Per-second rate of increase of a counter over the range `(range_start, range_end]`.
  pub fn rate(&self, range_start: i64, range_end: i64) -> Option<f64> {
    self.extrapolated_rate(range_start, range_end, true, true)
  }

  /// Increase of a counter over the range `(range_start, range_end]`.
  pub fn increase(&self, range_start: i64, range_end: i64) -> Option<f64> {
    self.extrapolated_rate(range_start, range_end, true, false)
  }

  /// Difference between the first and last value of a gauge, extrapolated to the range.
  pub fn delta(&self, range_start: i64, range_end: i64) -> Option<f64> {
    self.extrapolated_rate(range_start, range_end, false, false)
  }

  /// Calculates the rate, increase or delta of the points, extrapolating to the edges of the
  /// range when the first or last point is close enough to them. Counter resets are corrected
  /// for when `is_counter` is set.
  fn extrapolated_rate(
    &self,
    range_start: i64,
    range_end: i64,
    is_counter: bool,
    is_rate: bool,
  ) -> Option<f64> {
    let points = &self.metric_points;
    if points.len() < 2 {
      return None;
    }

    let first = &points[0];
    let last = &points[points.len() - 1];

    let mut result = last.get_value() - first.get_value();
    if is_counter {
      for window in points.windows(2) {
        if window[1].get_value() < window[0].get_value() {
          result += window[0].get_value();
        }
      }
    }

    let mut duration_to_start = (first.get_time() - range_start) as f64 / 1000.0;
    let mut duration_to_end = (range_end - last.get_time()) as f64 / 1000.0;
    let sampled_interval = (last.get_time() - first.get_time()) as f64 / 1000.0;
    if sampled_interval <= 0.0 {
      return None;
    }
    let average_duration_between_points = sampled_interval / (points.len() - 1) as f64;

    // Extrapolate to the edge of the range only when the gap is not much larger than the
    // typical gap between points. Otherwise assume the series starts or ends half a gap away.
    let extrapolation_threshold = average_duration_between_points * 1.1;
    if duration_to_start >= extrapolation_threshold {
      duration_to_start = average_duration_between_points / 2.0;
    }

    // A counter cannot go below zero, so do not extrapolate past the point it would hit zero.
    if is_counter && result > 0.0 && first.get_value() >= 0.0 {
      let duration_to_zero = sampled_interval * (first.get_value() / result);
      if duration_to_zero < duration_to_start {
        duration_to_start = duration_to_zero;
      }
    }

    if duration_to_end >= extrapolation_threshold {
      duration_to_end = average_duration_between_points / 2.0;
    }

    let extrapolate_to_interval = sampled_interval + duration_to_start + duration_to_end;
    let mut factor = extrapolate_to_interval / sampled_interval;
    if is_rate {
      factor /= (range_end - range_start) as f64 / 1000.0;
    }

    Some(result * factor)
  }

  /// Per-second rate computed from the last two points.
  pub fn irate(&self) -> Option<f64> {
    let points = &self.metric_points;
    if points.len() < 2 {
      return None;
    }

    let last = &points[points.len() - 1];
    let previous = &points[points.len() - 2];

    let increase = if last.get_value() < previous.get_value() {
      // Counter reset.
      last.get_value()
    } else {
      last.get_value() - previous.get_value()
    };

    let interval = last.get_time() - previous.get_time();
    if interval <= 0 {
      return None;
    }

    Some(increase / (interval as f64 / 1000.0))
  }

  pub fn avg_over_time(&self) -> Option<f64> {
    let sum = self.sum_over_time()?;
    Some(sum / self.metric_points.len() as f64)
  }

  pub fn sum_over_time(&self) -> Option<f64> {
    if self.metric_points.is_empty() {
      return None;
    }
    Some(self.metric_points.iter().map(|mp| mp.get_value()).sum())
  }

  /// Minimum value. NaN values are ignored unless every value is NaN.
  pub fn min_over_time(&self) -> Option<f64> {
    self
      .metric_points
      .iter()
      .map(|mp| mp.get_value())
      .reduce(|min, value| if value < min || min.is_nan() { value } else { min })
  }

  /// Maximum value. NaN values are ignored unless every value is NaN.
  pub fn max_over_time(&self) -> Option<f64> {
    self
      .metric_points
      .iter()
      .map(|mp| mp.get_value())
      .reduce(|max, value| if value > max || max.is_nan() { value } else { max })
  }

  pub fn count_over_time(&self) -> Option<f64> {
    if self.metric_points.is_empty() {
      return None;
    }
    Some(self.metric_points.len() as f64)
  }

  pub fn last_over_time(&self) -> Option<f64> {
    self.metric_points.last().map(|mp| mp.get_value())
  }

  /// Population variance of the values.
  pub fn stdvar_over_time(&self) -> Option<f64> {
    let mean = self.avg_over_time()?;
    let count = self.metric_points.len() as f64;
    Some(
      self
        .metric_points
        .iter()
        .map(|mp| (mp.get_value() - mean).powi(2))
        .sum::<f64>()
        / count,
    )
  }

  /// Population standard deviation of the values.
  pub fn stddev_over_time(&self) -> Option<f64> {
    self.stdvar_over_time().map(f64::sqrt)
  }

  /// Number of times the value changed between consecutive points. Two NaNs are not a change.
  pub fn changes(&self) -> Option<f64> {
    if self.metric_points.is_empty() {
      return None;
    }
    let changes = self
      .metric_points
      .windows(2)
      .filter(|w| {
        let (previous, current) = (w[0].get_value(), w[1].get_value());
        current != previous && !(current.is_nan() && previous.is_nan())
      })
      .count();
    Some(changes as f64)
  }

  /// Number of counter resets, i.e. decreases between consecutive points.
  pub fn resets(&self) -> Option<f64> {
    if self.metric_points.is_empty() {
      return None;
    }
    let resets = self
      .metric_points
      .windows(2)
      .filter(|w| w[1].get_value() < w[0].get_value())
      .count();
    Some(resets as f64)
  }

  /// Per-second derivative of a gauge, from a least-squares fit of the points.
  pub fn deriv(&self) -> Option<f64> {
    let points = &self.metric_points;
    if points.len() < 2 {
      return None;
    }

    let first_value = points[0].get_value();
    if points.iter().all(|mp| mp.get_value() == first_value) {
      return Some(0.0);
    }

    // Times are taken relative to the first point to keep the sums small.
    let intercept_time = points[0].get_time();
    let n = points.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for mp in points {
      let x = (mp.get_time() - intercept_time) as f64 / 1000.0;
      let y = mp.get_value();
      sum_x += x;
      sum_y += y;
      sum_xy += x * y;
      sum_x2 += x * x;
    }

    let covariance = sum_xy - sum_x * sum_y / n;
    let variance = sum_x2 - sum_x * sum_x / n;
    Some(covariance / variance)
  }
}
