// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Rule files in the Prometheus YAML format:
//!
//! ```yaml
//! groups:
//!   - name: example
//!     interval: 1m
//!     rules:
//!       - record: job:http_requests:rate5m
//!         expr: sum by (job) (rate(http_requests_total[5m]))
//!         labels:
//!           team: infra
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;

use crate::metric::constants::METRIC_NAME_LABEL;
use crate::metric::labels::is_valid_label_name;
use crate::utils::custom_serde::scalar_string_serde;
use crate::utils::error::RuleError;
use crate::utils::time::parse_duration;

lazy_static! {
  static ref METRIC_NAME_REGEX: Regex = Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap();
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroups {
  #[serde(default)]
  pub groups: Vec<RuleGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleGroup {
  pub name: String,

  #[serde(default)]
  pub interval: Option<String>,

  #[serde(default)]
  pub query_offset: Option<String>,

  #[serde(default)]
  pub limit: Option<u64>,

  #[serde(default)]
  pub rules: Vec<RuleNode>,
}

/// A recording or alerting rule, as written in the file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleNode {
  #[serde(default)]
  pub record: Option<String>,

  #[serde(default)]
  pub alert: Option<String>,

  #[serde(default, with = "scalar_string_serde")]
  pub expr: String,

  #[serde(default, rename = "for")]
  pub for_duration: Option<String>,

  #[serde(default)]
  pub keep_firing_for: Option<String>,

  #[serde(default)]
  pub labels: BTreeMap<String, Value>,

  #[serde(default)]
  pub annotations: BTreeMap<String, Value>,
}

impl RuleNode {
  /// The record name, if this is a recording rule.
  pub fn get_record(&self) -> Option<&str> {
    self.record.as_deref().filter(|r| !r.is_empty())
  }

  /// The extra labels, with every value converted to a string.
  pub fn get_labels(&self) -> BTreeMap<String, String> {
    self
      .labels
      .iter()
      .filter_map(|(name, value)| scalar_to_string(value).map(|v| (name.clone(), v)))
      .collect()
  }
}

impl RuleGroup {
  /// The declared evaluation interval in milliseconds. An absent or zero interval means the
  /// global default applies.
  pub fn get_interval(&self) -> Result<Option<i64>, String> {
    match &self.interval {
      Some(interval) => {
        let interval = parse_duration(interval)?;
        Ok(if interval == 0 { None } else { Some(interval) })
      }
      None => Ok(None),
    }
  }
}

fn scalar_to_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    Value::Null => Some(String::new()),
    _ => None,
  }
}

/// Read and validate the rule file at the given path.
pub fn parse_file(path: &str) -> Result<RuleGroups, Vec<RuleError>> {
  let content = fs::read_to_string(path).map_err(|e| {
    vec![RuleError::InvalidFile {
      file: path.to_owned(),
      reason: e.to_string(),
    }]
  })?;
  parse_str(&content, path)
}

/// Parse and validate rule file content. `file` is only used in error messages.
pub fn parse_str(content: &str, file: &str) -> Result<RuleGroups, Vec<RuleError>> {
  // An empty document is an empty rule file.
  if content.trim().is_empty() {
    return Ok(RuleGroups::default());
  }

  let groups: RuleGroups = serde_yaml::from_str(content).map_err(|e| {
    vec![RuleError::InvalidFile {
      file: file.to_owned(),
      reason: e.to_string(),
    }]
  })?;

  let errors = groups.validate(file);
  if errors.is_empty() {
    Ok(groups)
  } else {
    Err(errors)
  }
}

impl RuleGroups {
  /// Check the structure of every group and rule. Returns every problem found, not just the first.
  pub fn validate(&self, file: &str) -> Vec<RuleError> {
    let mut errors = Vec::new();
    let mut names = HashSet::new();

    for group in &self.groups {
      let group_error = |reason: String| RuleError::InvalidGroup {
        file: file.to_owned(),
        group: group.name.clone(),
        reason,
      };

      if group.name.is_empty() {
        errors.push(group_error("group name must not be empty".to_owned()));
      } else if !names.insert(group.name.as_str()) {
        errors.push(group_error(
          "group name is repeated in the same file".to_owned(),
        ));
      }

      if let Err(e) = group.get_interval() {
        errors.push(group_error(format!("invalid interval: {}", e)));
      }
      if let Some(query_offset) = &group.query_offset {
        if let Err(e) = parse_duration(query_offset) {
          errors.push(group_error(format!("invalid query_offset: {}", e)));
        }
      }

      for (index, rule) in group.rules.iter().enumerate() {
        for reason in validate_rule(rule) {
          errors.push(RuleError::InvalidRule {
            file: file.to_owned(),
            group: group.name.clone(),
            index,
            reason,
          });
        }
      }
    }

    errors
  }
}

fn validate_rule(rule: &RuleNode) -> Vec<String> {
  let mut reasons = Vec::new();

  let record = rule.record.as_deref().unwrap_or("");
  let alert = rule.alert.as_deref().unwrap_or("");
  match (record.is_empty(), alert.is_empty()) {
    (false, false) => reasons.push("only one of 'record' and 'alert' must be set".to_owned()),
    (true, true) => reasons.push("one of 'record' or 'alert' must be set".to_owned()),
    _ => {}
  }

  if rule.expr.trim().is_empty() {
    reasons.push("field 'expr' must be set in rule".to_owned());
  }

  if !record.is_empty() {
    if !METRIC_NAME_REGEX.is_match(record) {
      reasons.push(format!("invalid recording rule name: {}", record));
    }
    if rule.for_duration.is_some() {
      reasons.push("invalid field 'for' in recording rule".to_owned());
    }
    if rule.keep_firing_for.is_some() {
      reasons.push("invalid field 'keep_firing_for' in recording rule".to_owned());
    }
    if !rule.annotations.is_empty() {
      reasons.push("invalid field 'annotations' in recording rule".to_owned());
    }
  }

  for (name, value) in &rule.labels {
    if !is_valid_label_name(name) || name == METRIC_NAME_LABEL {
      reasons.push(format!("invalid label name: {}", name));
    }
    if scalar_to_string(value).is_none() {
      reasons.push(format!("label {} must have a string value", name));
    }
  }

  for duration in [&rule.for_duration, &rule.keep_firing_for].into_iter().flatten() {
    if let Err(e) = parse_duration(duration) {
      reasons.push(format!("invalid duration {:?}: {}", duration, e));
    }
  }

  reasons
}

#[cfg(test)]
mod tests {
  use std::io::Write;

  use tempfile::NamedTempFile;

  use super::*;

  #[test]
  fn test_parse_valid_file() {
    let content = r#"
groups:
  - name: http
    interval: 1m
    rules:
      - record: job:http_requests:rate5m
        expr: sum by (job) (rate(http_requests_total[5m]))
        labels:
          team: infra
          tier: 1
      - alert: HighErrorRate
        expr: job:http_requests:rate5m > 10
        for: 10m
        annotations:
          summary: too many requests
  - name: defaults
    rules:
      - record: answer
        expr: 42
"#;
    let groups = parse_str(content, "rules.yml").unwrap();
    assert_eq!(groups.groups.len(), 2);

    let http = &groups.groups[0];
    assert_eq!(http.get_interval(), Ok(Some(60_000)));
    assert_eq!(http.rules[0].get_record(), Some("job:http_requests:rate5m"));
    assert_eq!(
      http.rules[0].get_labels(),
      vec![
        ("team".to_owned(), "infra".to_owned()),
        ("tier".to_owned(), "1".to_owned())
      ]
      .into_iter()
      .collect()
    );
    assert_eq!(http.rules[1].get_record(), None);

    let defaults = &groups.groups[1];
    assert_eq!(defaults.get_interval(), Ok(None));
    assert_eq!(defaults.rules[0].expr, "42");
  }

  #[test]
  fn test_all_errors_are_reported() {
    let content = r#"
groups:
  - name: a
    interval: soon
    rules:
      - record: "not a metric"
        expr: up
        for: 5m
      - expr: up
      - record: x
        alert: y
        expr: ""
        labels:
          __name__: z
  - name: a
    rules: []
"#;
    let errors = parse_str(content, "rules.yml").unwrap_err();
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();

    let expected = [
      "invalid interval",
      "invalid recording rule name: not a metric",
      "invalid field 'for' in recording rule",
      "one of 'record' or 'alert' must be set",
      "only one of 'record' and 'alert' must be set",
      "field 'expr' must be set in rule",
      "invalid label name: __name__",
      "group name is repeated in the same file",
    ];
    for text in expected {
      assert!(
        messages.iter().any(|m| m.contains(text)),
        "missing {:?} in {:?}",
        text,
        messages
      );
    }
    assert!(messages[1].starts_with("rules.yml: group \"a\", rule 0:"));
  }

  #[test]
  fn test_unknown_fields_are_rejected() {
    let content = "groups:\n  - name: a\n    rulez: []\n";
    let errors = parse_str(content, "rules.yml").unwrap_err();
    assert!(matches!(errors[0], RuleError::InvalidFile { .. }));
  }

  #[test]
  fn test_parse_file() {
    let mut file = NamedTempFile::new().unwrap();
    let content = "groups:\n  - name: a\n    rules:\n      - record: x\n        expr: up";
    writeln!(file, "{}", content).unwrap();
    let groups = parse_file(file.path().to_str().unwrap()).unwrap();
    assert_eq!(groups.groups[0].rules[0].get_record(), Some("x"));

    let errors = parse_file("/nonexistent/rules.yml").unwrap_err();
    assert!(matches!(errors[0], RuleError::InvalidFile { .. }));

    // An empty file has no groups.
    let empty = NamedTempFile::new().unwrap();
    let groups = parse_file(empty.path().to_str().unwrap()).unwrap();
    assert!(groups.groups.is_empty());
  }
}
