// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::fmt;

use regex::Regex;

use crate::metric::constants::MetricsQueryCondition;
use crate::metric::labels::Labels;

/// Matches one label of a series against a value, an exact string or an anchored regular
/// expression.
#[derive(Clone, Debug)]
pub struct LabelMatcher {
  label_name: String,
  label_value: String,
  condition: MetricsQueryCondition,
  regex: Option<Regex>,
}

impl LabelMatcher {
  /// Create a new matcher. Regular expressions are fully anchored, so `job=~"api"` does not
  /// match "api-2".
  pub fn new(
    label_name: &str,
    label_value: &str,
    condition: MetricsQueryCondition,
  ) -> Result<Self, String> {
    let regex = match condition {
      MetricsQueryCondition::EqualsRegex | MetricsQueryCondition::NotEqualsRegex => Some(
        Regex::new(&format!("^(?:{})$", label_value))
          .map_err(|e| format!("Invalid regular expression {:?}: {}", label_value, e))?,
      ),
      _ => None,
    };

    Ok(LabelMatcher {
      label_name: label_name.to_owned(),
      label_value: label_value.to_owned(),
      condition,
      regex,
    })
  }

  pub fn get_label_name(&self) -> &str {
    &self.label_name
  }

  pub fn get_label_value(&self) -> &str {
    &self.label_value
  }

  pub fn get_condition(&self) -> MetricsQueryCondition {
    self.condition
  }

  /// Check a single value. A missing label is treated as the empty string.
  pub fn matches_value(&self, value: &str) -> bool {
    match self.condition {
      MetricsQueryCondition::Equals => value == self.label_value,
      MetricsQueryCondition::NotEquals => value != self.label_value,
      MetricsQueryCondition::EqualsRegex => self.regex.as_ref().is_some_and(|r| r.is_match(value)),
      MetricsQueryCondition::NotEqualsRegex => {
        !self.regex.as_ref().is_some_and(|r| r.is_match(value))
      }
    }
  }

  /// Check whether the given series labels satisfy this matcher.
  pub fn matches(&self, labels: &Labels) -> bool {
    self.matches_value(labels.get(&self.label_name).unwrap_or(""))
  }
}

impl PartialEq for LabelMatcher {
  fn eq(&self, other: &Self) -> bool {
    self.label_name == other.label_name
      && self.label_value == other.label_value
      && self.condition == other.condition
  }
}

impl fmt::Display for LabelMatcher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let op = match self.condition {
      MetricsQueryCondition::Equals => "=",
      MetricsQueryCondition::NotEquals => "!=",
      MetricsQueryCondition::EqualsRegex => "=~",
      MetricsQueryCondition::NotEqualsRegex => "!~",
    };
    write!(f, "{}{}{:?}", self.label_name, op, self.label_value)
  }
}

/// Check whether the series labels satisfy every matcher.
pub fn matches_all(matchers: &[LabelMatcher], labels: &Labels) -> bool {
  matchers.iter().all(|m| m.matches(labels))
}
