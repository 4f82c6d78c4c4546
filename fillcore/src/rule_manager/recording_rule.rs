// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::collections::BTreeMap;

use log::{debug, info};

use crate::query_manager::parser::parse_expr;
use crate::rule_manager::rule_file::{parse_file, RuleGroups};
use crate::utils::error::{BackfillError, RuleError};

/// A recording rule ready to be evaluated.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingRule {
  name: String,
  expr: String,
  labels: BTreeMap<String, String>,
  interval: Option<i64>,
  group_name: String,
}

impl RecordingRule {
  pub fn new(
    name: &str,
    expr: &str,
    labels: BTreeMap<String, String>,
    interval: Option<i64>,
    group_name: &str,
  ) -> Self {
    RecordingRule {
      name: name.to_owned(),
      expr: expr.to_owned(),
      labels,
      interval,
      group_name: group_name.to_owned(),
    }
  }

  /// The name of the series this rule records.
  pub fn get_name(&self) -> &str {
    &self.name
  }

  pub fn get_expr(&self) -> &str {
    &self.expr
  }

  /// Extra labels added to every recorded sample.
  pub fn get_labels(&self) -> &BTreeMap<String, String> {
    &self.labels
  }

  /// Evaluation interval of the enclosing group in milliseconds, if the group declares one.
  pub fn get_interval(&self) -> Option<i64> {
    self.interval
  }

  pub fn get_group_name(&self) -> &str {
    &self.group_name
  }
}

/// Turn validated rule groups into recording rules, in group order and then rule order.
/// Alerting rules are skipped. Every expression that does not parse is reported.
pub fn normalize(groups: &RuleGroups, file: &str) -> Result<Vec<RecordingRule>, Vec<RuleError>> {
  let mut rules = Vec::new();
  let mut errors = Vec::new();

  for group in &groups.groups {
    let interval = match group.get_interval() {
      Ok(interval) => interval,
      Err(reason) => {
        errors.push(RuleError::InvalidGroup {
          file: file.to_owned(),
          group: group.name.clone(),
          reason: format!("invalid interval: {}", reason),
        });
        continue;
      }
    };

    for rule in &group.rules {
      let Some(record) = rule.get_record() else {
        debug!(
          "Skipping alerting rule {:?} in group {:?}",
          rule.alert.as_deref().unwrap_or(""),
          group.name
        );
        continue;
      };

      if let Err(e) = parse_expr(&rule.expr) {
        errors.push(RuleError::InvalidExpression {
          file: file.to_owned(),
          group: group.name.clone(),
          record: record.to_owned(),
          expr: rule.expr.clone(),
          reason: e.to_string(),
        });
        continue;
      }

      rules.push(RecordingRule::new(
        record,
        &rule.expr,
        rule.get_labels(),
        interval,
        &group.name,
      ));
    }
  }

  if errors.is_empty() {
    Ok(rules)
  } else {
    Err(errors)
  }
}

/// Load every recording rule from the given rule file. Any problem in the file fails the load
/// with the complete list of problems.
pub fn load_rules(path: &str) -> Result<Vec<RecordingRule>, BackfillError> {
  let groups = parse_file(path).map_err(BackfillError::RuleErrors)?;
  let rules = normalize(&groups, path).map_err(BackfillError::RuleErrors)?;
  info!("Loaded {} recording rules from {}", rules.len(), path);
  Ok(rules)
}
