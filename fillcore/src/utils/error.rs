// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
/// Enum for various errors in fillcore.
pub enum BackfillError {
  #[error("Invalid configuration. {0}")]
  InvalidConfiguration(String),

  #[error("Cannot load rules. {}", join_rule_errors(.0))]
  RuleErrors(Vec<RuleError>),

  #[error("Invalid time range. {0}")]
  InvalidTimeRange(String),

  #[error("Query for rule {rule} at time {time} failed: {cause}")]
  QueryFailed {
    rule: String,
    time: i64,
    cause: QueryError,
  },

  #[error("Time series block is empty - cannot be written.")]
  EmptyBlock(),

  #[error("Storage Error: {0}")]
  StorageError(String),

  #[error("IO Error: {0}")]
  IOError(String),

  #[error("Scheduler cannot run in state {0}.")]
  InvalidSchedulerState(String),
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
/// Errors returned by the query capability for a single evaluation.
pub enum QueryError {
  #[error("Query timed out. {0}")]
  Timeout(String),

  #[error("Query loaded more than {0} samples.")]
  TooManySamples(usize),

  #[error("Bad expression. {0}")]
  BadExpression(String),

  #[error("Internal query error. {0}")]
  Internal(String),
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
/// A single problem found while loading a rule file.
pub enum RuleError {
  #[error("{file}: {reason}")]
  InvalidFile { file: String, reason: String },

  #[error("{file}: group {group:?}: {reason}")]
  InvalidGroup {
    file: String,
    group: String,
    reason: String,
  },

  #[error("{file}: group {group:?}, rule {index}: {reason}")]
  InvalidRule {
    file: String,
    group: String,
    index: usize,
    reason: String,
  },

  #[error("{file}: group {group:?}, rule {record:?}: cannot parse expression {expr:?}: {reason}")]
  InvalidExpression {
    file: String,
    group: String,
    record: String,
    expr: String,
    reason: String,
  },
}

fn join_rule_errors(errors: &[RuleError]) -> String {
  errors
    .iter()
    .map(|e| e.to_string())
    .collect::<Vec<String>>()
    .join("; ")
}

impl From<std::io::Error> for BackfillError {
  fn from(error: std::io::Error) -> Self {
    BackfillError::IOError(error.to_string())
  }
}

impl From<serde_json::Error> for BackfillError {
  fn from(error: serde_json::Error) -> Self {
    BackfillError::StorageError(error.to_string())
  }
}

impl From<config::ConfigError> for BackfillError {
  fn from(error: config::ConfigError) -> Self {
    BackfillError::InvalidConfiguration(error.to_string())
  }
}
