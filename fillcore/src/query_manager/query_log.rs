// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use chrono::{SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::utils::error::BackfillError;

/// One executed query, as written to the query log.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct QueryLogEntry {
  pub query: String,

  /// Evaluation time, in milliseconds since epoch.
  pub time: i64,

  pub duration_ms: u64,

  #[serde(skip_serializing_if = "Option::is_none", default)]
  pub error: Option<String>,

  /// Wall clock time the entry was written, RFC3339.
  pub logged_at: String,
}

/// Appends one JSON line per executed query to a file.
#[derive(Debug)]
pub struct QueryLogger {
  path: String,
  writer: BufWriter<File>,
}

impl QueryLogger {
  /// Open the log file for appending, creating it if needed.
  pub fn new(path: &str) -> Result<Self, BackfillError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    debug!("Logging queries to {}", path);
    Ok(QueryLogger {
      path: path.to_owned(),
      writer: BufWriter::new(file),
    })
  }

  pub fn get_path(&self) -> &str {
    &self.path
  }

  pub fn log(
    &mut self,
    query: &str,
    time: i64,
    duration_ms: u64,
    error: Option<String>,
  ) -> Result<(), BackfillError> {
    let entry = QueryLogEntry {
      query: query.to_owned(),
      time,
      duration_ms,
      error,
      logged_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    serde_json::to_writer(&mut self.writer, &entry)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<(), BackfillError> {
    self.writer.flush()?;
    Ok(())
  }
}

impl Drop for QueryLogger {
  fn drop(&mut self) {
    // Errors cannot be returned from drop; callers that care call flush() first.
    let _ = self.writer.flush();
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use tempdir::TempDir;

  use super::*;
  use crate::utils::io::get_joined_path;

  #[test]
  fn test_query_log_lines() {
    let dir = TempDir::new("query_log_test").unwrap();
    let path = get_joined_path(dir.path().to_str().unwrap(), "queries.log");

    let mut logger = QueryLogger::new(&path).unwrap();
    logger.log("up", 1000, 3, None).unwrap();
    logger
      .log("rate(x[5m])", 2000, 1, Some("Query timed out.".to_owned()))
      .unwrap();
    logger.flush().unwrap();

    let contents = fs::read_to_string(&path).unwrap();
    let entries: Vec<QueryLogEntry> = contents
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].query, "up");
    assert_eq!(entries[0].time, 1000);
    assert_eq!(entries[0].error, None);
    assert_eq!(entries[1].error.as_deref(), Some("Query timed out."));
    assert!(!contents.lines().next().unwrap().contains("error"));
  }

  #[test]
  fn test_appends_to_existing_file() {
    let dir = TempDir::new("query_log_test").unwrap();
    let path = get_joined_path(dir.path().to_str().unwrap(), "queries.log");

    for _ in 0..2 {
      let mut logger = QueryLogger::new(&path).unwrap();
      logger.log("up", 1000, 0, None).unwrap();
    }

    assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
  }
}
