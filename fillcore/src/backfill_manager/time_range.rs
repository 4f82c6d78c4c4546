// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use chrono::DateTime;
use log::{info, warn};

use crate::utils::error::BackfillError;

/// Inclusive range of timestamps in milliseconds to backfill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
  start: i64,
  end: i64,
}

impl TimeRange {
  pub fn new(start: i64, end: i64) -> Result<Self, BackfillError> {
    if start > end {
      return Err(BackfillError::InvalidTimeRange(format!(
        "start {} is after end {}",
        start, end
      )));
    }
    Ok(TimeRange { start, end })
  }

  pub fn get_start(&self) -> i64 {
    self.start
  }

  pub fn get_end(&self) -> i64 {
    self.end
  }

  /// Resolve the range to evaluate from the bounds of the source store and the optional user
  /// overrides. Overrides are clamped to the store bounds. Without an end override, the range
  /// stops `head_safety_margin` before `now`.
  pub fn resolve(
    storage_min: Option<i64>,
    storage_max: Option<i64>,
    start: Option<&str>,
    end: Option<&str>,
    head_safety_margin: i64,
    now: i64,
  ) -> Result<Self, BackfillError> {
    let (storage_min, storage_max) = match (storage_min, storage_max) {
      (Some(min), Some(max)) => (min, max),
      _ => {
        return Err(BackfillError::InvalidConfiguration(
          "The source store has no data to backfill from".to_owned(),
        ))
      }
    };

    let start = match start {
      Some(s) => {
        let requested = parse_time(s)?;
        if requested < storage_min {
          warn!(
            "Start time {} is before the earliest stored sample, using {}",
            requested, storage_min
          );
          storage_min
        } else {
          requested
        }
      }
      None => storage_min,
    };

    let end = match end {
      Some(s) => {
        let requested = parse_time(s)?;
        if requested > storage_max {
          warn!(
            "End time {} is after the latest stored sample, using {}",
            requested, storage_max
          );
          storage_max
        } else {
          requested
        }
      }
      None => storage_max.min(now - head_safety_margin),
    };

    let range = TimeRange::new(start, end)?;
    info!("Backfilling time range [{}, {}]", start, end);
    Ok(range)
  }
}

/// Parse a timestamp given either as (possibly fractional) Unix seconds or as an RFC3339 date.
/// Returns milliseconds since epoch.
pub fn parse_time(s: &str) -> Result<i64, BackfillError> {
  let s = s.trim();
  if let Ok(seconds) = s.parse::<f64>() {
    if seconds.is_finite() {
      return Ok((seconds * 1000.0).round() as i64);
    }
  }

  DateTime::parse_from_rfc3339(s)
    .map(|t| t.timestamp_millis())
    .map_err(|_| {
      BackfillError::InvalidConfiguration(format!("Cannot parse {:?} to a valid timestamp", s))
    })
}
