// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use crate::metric::constants::METRIC_NAME_LABEL;
use crate::metric::sample::Sample;
use crate::query_manager::engine::RawResult;
use crate::rule_manager::recording_rule::RecordingRule;

/// Turn a raw query result into the sample recorded by the rule at time `time`: the metric name
/// becomes the rule name, and the rule's extra labels overwrite any labels of the same name.
pub fn relabel(raw: RawResult, rule: &RecordingRule, time: i64) -> Sample {
  let value = raw.get_value();
  let mut labels = raw.into_labels();
  labels.set(METRIC_NAME_LABEL, rule.get_name());
  for (name, value) in rule.get_labels() {
    labels.set(name, value);
  }
  Sample::new(labels, time, value)
}
