// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Backfilling of Prometheus recording rules.
//!
//! Recording rules are evaluated against the data already in a store, at every step of the
//! store's time range, and the results are written as new immutable blocks.

pub mod backfill_manager;
pub mod metric;
pub mod query_manager;
pub mod rule_manager;
pub mod storage_manager;
pub mod utils;

use log::info;

use crate::backfill_manager::flusher::BatchFlusher;
use crate::backfill_manager::metrics::BackfillMetrics;
use crate::backfill_manager::scheduler::{EvaluationScheduler, RunSummary};
use crate::backfill_manager::time_range::TimeRange;
use crate::query_manager::engine::PromQLEngine;
use crate::rule_manager::recording_rule::load_rules;
use crate::storage_manager::block::FsBlockWriter;
use crate::storage_manager::db::Db;
use crate::utils::config::Settings;
use crate::utils::error::BackfillError;
use crate::utils::sync::Arc;
use crate::utils::time::get_current_time_in_millis;

/// Backfills recording rules from one store into another.
pub struct Backfill {
  settings: Settings,
}

impl Backfill {
  /// Create a backfill with the settings in the given configuration directory.
  pub fn new(config_dir_path: &str) -> Result<Self, BackfillError> {
    let settings = Settings::new(config_dir_path)?;
    Ok(Backfill { settings })
  }

  pub fn with_settings(settings: Settings) -> Self {
    Backfill { settings }
  }

  pub fn get_settings(&self) -> &Settings {
    &self.settings
  }

  pub fn get_settings_mut(&mut self) -> &mut Settings {
    &mut self.settings
  }

  /// Evaluate every recording rule in `rule_file` against the store in `db_path` and write the
  /// results as blocks in `dest_path`. `start` and `end` optionally narrow the time range, as
  /// Unix seconds or RFC3339 dates.
  pub fn run(
    &self,
    rule_file: &str,
    db_path: &str,
    dest_path: &str,
    start: Option<&str>,
    end: Option<&str>,
  ) -> Result<RunSummary, BackfillError> {
    let backfill_settings = self.settings.get_backfill_settings();

    // Every rule must load before anything is evaluated.
    let rules = load_rules(rule_file)?;

    let db = Db::open(
      db_path,
      self.settings.get_storage_settings().get_use_lockfile(),
    )?;
    let range = TimeRange::resolve(
      db.get_min_time(),
      db.get_max_time(),
      start,
      end,
      backfill_settings.get_head_safety_margin(),
      get_current_time_in_millis(),
    )?;

    let metrics = Arc::new(BackfillMetrics::new());
    let engine =
      PromQLEngine::from_settings(&db, self.settings.get_query_settings(), metrics.clone())?;
    let writer = FsBlockWriter::new();
    let mut flusher = BatchFlusher::new(
      &writer,
      dest_path,
      backfill_settings.get_max_samples_per_block(),
      metrics.clone(),
    )?;
    let mut scheduler = EvaluationScheduler::new(
      &engine,
      backfill_settings.get_default_eval_interval(),
      backfill_settings.get_on_query_error(),
      metrics.clone(),
    )?;

    let summary = scheduler.run(&rules, range, &mut flusher)?;
    info!("Backfill metrics: {}", metrics);
    Ok(summary)
  }
}
