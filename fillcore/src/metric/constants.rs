// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

/// The label that holds the metric name of a series.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Represents a condition to be used in a metrics query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MetricsQueryCondition {
  Equals,
  NotEquals,
  EqualsRegex,
  NotEqualsRegex,
}
