// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

/// Custom serde deserialize implementation for Prometheus-style durations, stored as milliseconds.
pub mod duration_serde {
  use serde::de::{Deserializer, Error};
  use serde::Deserialize;

  use crate::utils::time::parse_duration;

  /// Deserialize a duration string such as "30s" into milliseconds.
  pub fn deserialize<'de, D>(d: D) -> Result<i64, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(d)?;
    parse_duration(&s).map_err(D::Error::custom)
  }
}

/// Accept a YAML scalar (string, number or bool) as a string. Rule expressions such as `expr: 1`
/// are valid and arrive as numbers.
pub mod scalar_string_serde {
  use serde::de::{Deserializer, Error};
  use serde::Deserialize;
  use serde_yaml::Value;

  pub fn deserialize<'de, D>(d: D) -> Result<String, D::Error>
  where
    D: Deserializer<'de>,
  {
    match Value::deserialize(d)? {
      Value::String(s) => Ok(s),
      Value::Number(n) => Ok(n.to_string()),
      Value::Bool(b) => Ok(b.to_string()),
      Value::Null => Ok(String::new()),
      other => Err(D::Error::custom(format!(
        "expected a string, found {:?}",
        other
      ))),
    }
  }
}
