// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use chrono::Utc;

const MILLIS_PER_SECOND: i64 = 1000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;
const MILLIS_PER_WEEK: i64 = 7 * MILLIS_PER_DAY;
const MILLIS_PER_YEAR: i64 = 365 * MILLIS_PER_DAY;

/// Get the current time as milliseconds since epoch.
pub fn get_current_time_in_millis() -> i64 {
  Utc::now().timestamp_millis()
}

/// Parse a Prometheus-style duration string (e.g., "30s", "1h30m", "500ms") into milliseconds.
///
/// Units must appear in decreasing order of magnitude and at most once each, the same way
/// Prometheus validates durations in rule files and on the command line.
pub fn parse_duration(s: &str) -> Result<i64, String> {
  let s = s.trim();
  if s.is_empty() {
    return Err("Empty duration string".to_owned());
  }
  if s == "0" {
    return Ok(0);
  }

  let units: [(&str, i64); 7] = [
    ("y", MILLIS_PER_YEAR),
    ("w", MILLIS_PER_WEEK),
    ("d", MILLIS_PER_DAY),
    ("h", MILLIS_PER_HOUR),
    ("m", MILLIS_PER_MINUTE),
    ("s", MILLIS_PER_SECOND),
    ("ms", 1),
  ];

  let mut total: i64 = 0;
  let mut rest = s;
  let mut last_unit_index: Option<usize> = None;

  while !rest.is_empty() {
    let digits_len = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits_len == 0 {
      return Err(format!("Invalid duration {:?}: expected a number", s));
    }
    let value = rest[..digits_len]
      .parse::<i64>()
      .map_err(|_| format!("Invalid number in duration {:?}", s))?;
    rest = &rest[digits_len..];

    let unit_len = rest
      .chars()
      .take_while(|c| c.is_ascii_alphabetic())
      .count();
    let unit = &rest[..unit_len];
    rest = &rest[unit_len..];

    let unit_index = units
      .iter()
      .position(|(name, _)| *name == unit)
      .ok_or_else(|| format!("Unsupported duration unit {:?} in {:?}", unit, s))?;
    if let Some(last) = last_unit_index {
      if unit_index <= last {
        return Err(format!("Duration units out of order in {:?}", s));
      }
    }
    last_unit_index = Some(unit_index);

    total = value
      .checked_mul(units[unit_index].1)
      .and_then(|v| total.checked_add(v))
      .ok_or_else(|| format!("Duration {:?} is too large", s))?;
  }

  Ok(total)
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  #[test_case("30s", 30_000; "seconds")]
  #[test_case("2m", 120_000; "minutes")]
  #[test_case("1h30m", 5_400_000; "compound")]
  #[test_case("500ms", 500; "millis")]
  #[test_case("1d", 86_400_000; "days")]
  #[test_case("1w", 604_800_000; "weeks")]
  #[test_case("0", 0; "zero")]
  fn test_parse_duration(input: &str, expected: i64) {
    assert_eq!(parse_duration(input).unwrap(), expected);
  }

  #[test_case(""; "empty")]
  #[test_case("abc"; "no number")]
  #[test_case("10"; "no unit")]
  #[test_case("5x"; "bad unit")]
  #[test_case("30m1h"; "out of order")]
  #[test_case("1m1m"; "repeated unit")]
  fn test_parse_duration_errors(input: &str) {
    assert!(parse_duration(input).is_err());
  }

  #[test]
  fn test_current_time_is_recent() {
    // 2020-01-01T00:00:00Z
    assert!(get_current_time_in_millis() > 1_577_836_800_000);
  }
}
