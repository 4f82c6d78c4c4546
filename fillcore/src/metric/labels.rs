// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::collections::btree_map::Iter;
use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::metric::constants::METRIC_NAME_LABEL;

lazy_static! {
  static ref LABEL_NAME_REGEX: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap();
}

pub fn is_valid_label_name(name: &str) -> bool {
  LABEL_NAME_REGEX.is_match(name)
}

/// The set of labels that identifies a series. Labels are kept sorted by name, so two label
/// sets with the same pairs compare and hash equal regardless of how they were built.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Labels {
  labels: BTreeMap<String, String>,
}

impl Labels {
  /// Create an empty label set.
  pub fn new() -> Self {
    Labels {
      labels: BTreeMap::new(),
    }
  }

  /// Get the value of the given label, if present.
  pub fn get(&self, name: &str) -> Option<&str> {
    self.labels.get(name).map(|v| v.as_str())
  }

  /// Get the metric name, if present.
  pub fn get_metric_name(&self) -> Option<&str> {
    self.get(METRIC_NAME_LABEL)
  }

  /// Set a label, overwriting any existing value. Setting an empty value removes the label.
  pub fn set(&mut self, name: &str, value: &str) {
    if value.is_empty() {
      self.labels.remove(name);
    } else {
      self.labels.insert(name.to_owned(), value.to_owned());
    }
  }

  /// Remove a label.
  pub fn remove(&mut self, name: &str) {
    self.labels.remove(name);
  }

  /// Remove the metric name label.
  pub fn remove_metric_name(&mut self) {
    self.labels.remove(METRIC_NAME_LABEL);
  }

  /// Keep only the given label names.
  pub fn keep(&mut self, names: &[String]) {
    self.labels.retain(|name, _| names.contains(name));
  }

  /// Remove all the given label names.
  pub fn drop_names(&mut self, names: &[String]) {
    self.labels.retain(|name, _| !names.contains(name));
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn iter(&self) -> Iter<'_, String, String> {
    self.labels.iter()
  }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Labels {
  fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
    let mut labels = Labels::new();
    for (name, value) in iter {
      labels.set(name, value);
    }
    labels
  }
}

impl From<BTreeMap<String, String>> for Labels {
  fn from(map: BTreeMap<String, String>) -> Self {
    let mut labels = Labels::new();
    for (name, value) in map.iter() {
      labels.set(name, value);
    }
    labels
  }
}

impl fmt::Display for Labels {
  /// Format as `metric_name{label="value", ...}`, the way series are written in queries.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(name) = self.get_metric_name() {
      write!(f, "{}", name)?;
    }
    let rest: Vec<String> = self
      .labels
      .iter()
      .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL)
      .map(|(name, value)| format!("{}={:?}", name, value))
      .collect();
    if !rest.is_empty() || self.get_metric_name().is_none() {
      write!(f, "{{{}}}", rest.join(", "))?;
    }
    Ok(())
  }
}
