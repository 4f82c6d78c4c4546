// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::backfill_manager::scheduler::QueryErrorPolicy;
use crate::utils::custom_serde::duration_serde;

const DEFAULT_CONFIG_FILE_NAME: &str = "default.toml";

#[derive(Debug, Deserialize)]
/// Settings for the backfill walk.
pub struct BackfillSettings {
  /// Evaluation step used for rules whose group does not declare an interval.
  #[serde(with = "duration_serde")]
  default_eval_interval: i64,

  /// Number of samples collected before a block is written.
  max_samples_per_block: usize,

  /// Margin kept away from "now" when no end time is given, so that the live head of the
  /// store, which may still be receiving writes, is not evaluated.
  #[serde(with = "duration_serde")]
  head_safety_margin: i64,

  /// What to do when a single query fails.
  on_query_error: QueryErrorPolicy,
}

impl BackfillSettings {
  pub fn get_default_eval_interval(&self) -> i64 {
    self.default_eval_interval
  }

  pub fn get_max_samples_per_block(&self) -> usize {
    self.max_samples_per_block
  }

  pub fn get_head_safety_margin(&self) -> i64 {
    self.head_safety_margin
  }

  pub fn get_on_query_error(&self) -> QueryErrorPolicy {
    self.on_query_error
  }

  pub fn set_default_eval_interval(&mut self, value: i64) {
    self.default_eval_interval = value;
  }

  pub fn set_max_samples_per_block(&mut self, value: usize) {
    self.max_samples_per_block = value;
  }

  pub fn set_on_query_error(&mut self, value: QueryErrorPolicy) {
    self.on_query_error = value;
  }
}

#[derive(Debug, Deserialize)]
/// Settings for the query engine.
pub struct QuerySettings {
  /// Maximum number of samples a single query may load.
  max_samples: usize,

  /// Maximum time a single query may take, in milliseconds.
  #[serde(with = "duration_serde")]
  timeout: i64,

  /// How far back an instant selector looks for the latest sample.
  #[serde(with = "duration_serde")]
  lookback_delta: i64,

  /// File to which executed queries are logged. Empty means no query log.
  query_log_file: String,
}

impl QuerySettings {
  pub fn get_max_samples(&self) -> usize {
    self.max_samples
  }

  pub fn get_timeout(&self) -> i64 {
    self.timeout
  }

  pub fn get_lookback_delta(&self) -> i64 {
    self.lookback_delta
  }

  /// Get the query log file path, if one is configured.
  pub fn get_query_log_file(&self) -> Option<&str> {
    if self.query_log_file.is_empty() {
      None
    } else {
      Some(self.query_log_file.as_str())
    }
  }

  pub fn set_max_samples(&mut self, value: usize) {
    self.max_samples = value;
  }

  pub fn set_timeout(&mut self, value: i64) {
    self.timeout = value;
  }

  pub fn set_query_log_file(&mut self, value: &str) {
    self.query_log_file = value.to_owned();
  }
}

#[derive(Debug, Deserialize)]
/// Settings for the on-disk store.
pub struct StorageSettings {
  /// Hold a lock file in the source directory for the duration of the run.
  use_lockfile: bool,
}

impl StorageSettings {
  pub fn get_use_lockfile(&self) -> bool {
    self.use_lockfile
  }
}

#[derive(Debug, Deserialize)]
/// Settings for promfill, read from config file.
pub struct Settings {
  backfill: BackfillSettings,
  query: QuerySettings,
  storage: StorageSettings,
}

impl Settings {
  /// Create Settings from given configuration directory path. Every setting has a built-in
  /// default, so the directory does not need to contain any file.
  pub fn new(config_dir_path: &str) -> Result<Self, ConfigError> {
    let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
    let config_default_file_name = format!("{}/{}", config_dir_path, DEFAULT_CONFIG_FILE_NAME);
    let config_environment_file_name = format!("{}/{}.toml", config_dir_path, run_mode);

    let config = Self::with_defaults(Config::builder())?
      .add_source(File::with_name(&config_default_file_name).required(false))
      // Add in the current environment file
      // Default to 'development' env
      .add_source(File::with_name(&config_environment_file_name).required(false))
      // Eg.. `PROMFILL_BACKFILL__MAX_SAMPLES_PER_BLOCK=500` would set
      // `backfill.max_samples_per_block`
      .add_source(
        Environment::with_prefix("promfill")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()?;

    config.try_deserialize()
  }

  fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
  ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    builder
      .set_default("backfill.default_eval_interval", "30s")?
      .set_default("backfill.max_samples_per_block", 10000)?
      .set_default("backfill.head_safety_margin", "5m")?
      .set_default("backfill.on_query_error", "skip")?
      .set_default("query.max_samples", 50_000_000)?
      .set_default("query.timeout", "2m")?
      .set_default("query.lookback_delta", "5m")?
      .set_default("query.query_log_file", "")?
      .set_default("storage.use_lockfile", false)
  }

  pub fn get_backfill_settings(&self) -> &BackfillSettings {
    &self.backfill
  }

  pub fn get_backfill_settings_mut(&mut self) -> &mut BackfillSettings {
    &mut self.backfill
  }

  pub fn get_query_settings(&self) -> &QuerySettings {
    &self.query
  }

  pub fn get_query_settings_mut(&mut self) -> &mut QuerySettings {
    &mut self.query
  }

  pub fn get_storage_settings(&self) -> &StorageSettings {
    &self.storage
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::fs::File;
  use std::io::Write;

  use tempdir::TempDir;

  use crate::utils::io::get_joined_path;

  #[test]
  fn test_settings() {
    let config_dir = TempDir::new("config_test").unwrap();
    let config_dir_path = config_dir.path().to_str().unwrap();

    // An empty directory gives the built-in defaults.
    let settings = Settings::new(config_dir_path).unwrap();
    let backfill_settings = settings.get_backfill_settings();
    assert_eq!(backfill_settings.get_default_eval_interval(), 30_000);
    assert_eq!(backfill_settings.get_max_samples_per_block(), 10000);
    assert_eq!(backfill_settings.get_head_safety_margin(), 300_000);
    assert_eq!(backfill_settings.get_on_query_error(), QueryErrorPolicy::Skip);
    let query_settings = settings.get_query_settings();
    assert_eq!(query_settings.get_max_samples(), 50_000_000);
    assert_eq!(query_settings.get_timeout(), 120_000);
    assert_eq!(query_settings.get_lookback_delta(), 300_000);
    assert_eq!(query_settings.get_query_log_file(), None);
    assert!(!settings.get_storage_settings().get_use_lockfile());

    // Values in default.toml override the built-in defaults.
    let config_file_path = get_joined_path(config_dir_path, DEFAULT_CONFIG_FILE_NAME);
    {
      let mut file = File::create(&config_file_path).unwrap();
      file.write_all(b"[backfill]\n").unwrap();
      file.write_all(b"default_eval_interval = \"1m\"\n").unwrap();
      file.write_all(b"on_query_error = \"abort\"\n").unwrap();
      file.write_all(b"[query]\n").unwrap();
      file
        .write_all(b"query_log_file = \"/tmp/queries.log\"\n")
        .unwrap();
      file.write_all(b"[storage]\n").unwrap();
      file.write_all(b"use_lockfile = true\n").unwrap();
    }

    let mut settings = Settings::new(config_dir_path).unwrap();
    assert_eq!(
      settings.get_backfill_settings().get_default_eval_interval(),
      60_000
    );
    assert_eq!(
      settings.get_backfill_settings().get_on_query_error(),
      QueryErrorPolicy::Abort
    );
    assert_eq!(
      settings.get_query_settings().get_query_log_file(),
      Some("/tmp/queries.log")
    );
    assert!(settings.get_storage_settings().get_use_lockfile());

    // Setters are used for command line overrides.
    settings.get_backfill_settings_mut().set_max_samples_per_block(2);
    settings.get_query_settings_mut().set_timeout(1000);
    assert_eq!(settings.get_backfill_settings().get_max_samples_per_block(), 2);
    assert_eq!(settings.get_query_settings().get_timeout(), 1000);
  }

  #[test]
  fn test_invalid_settings() {
    let config_dir = TempDir::new("config_test").unwrap();
    let config_dir_path = config_dir.path().to_str().unwrap();
    let config_file_path = get_joined_path(config_dir_path, DEFAULT_CONFIG_FILE_NAME);
    {
      let mut file = File::create(&config_file_path).unwrap();
      file.write_all(b"[backfill]\n").unwrap();
      file
        .write_all(b"default_eval_interval = \"soon\"\n")
        .unwrap();
    }

    assert!(Settings::new(config_dir_path).is_err());
  }
}
