// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::fmt;

use crossbeam::atomic::AtomicCell;

/// Counters for one backfill run. A single handle is created per run and shared with the query
/// engine, the scheduler and the flusher.
#[derive(Debug)]
pub struct BackfillMetrics {
  /// Number of queries executed by the engine.
  queries: AtomicCell<u64>,

  /// Number of queries that returned an error.
  query_failures: AtomicCell<u64>,

  /// Total wall time spent in queries, in milliseconds.
  query_duration_millis: AtomicCell<u64>,

  /// Number of stored samples loaded by queries.
  samples_loaded: AtomicCell<u64>,

  /// Number of evaluation instants the scheduler skipped because of a query error.
  instants_skipped: AtomicCell<u64>,

  /// Number of samples appended to a batch.
  samples_appended: AtomicCell<u64>,

  /// Number of blocks written.
  blocks_created: AtomicCell<u64>,
}

impl BackfillMetrics {
  pub fn new() -> Self {
    BackfillMetrics {
      queries: AtomicCell::new(0),
      query_failures: AtomicCell::new(0),
      query_duration_millis: AtomicCell::new(0),
      samples_loaded: AtomicCell::new(0),
      instants_skipped: AtomicCell::new(0),
      samples_appended: AtomicCell::new(0),
      blocks_created: AtomicCell::new(0),
    }
  }

  /// Record one executed query, its duration and whether it failed.
  pub fn record_query(&self, duration_millis: u64, failed: bool) {
    self.queries.fetch_add(1);
    self.query_duration_millis.fetch_add(duration_millis);
    if failed {
      self.query_failures.fetch_add(1);
    }
  }

  pub fn add_samples_loaded(&self, count: u64) {
    self.samples_loaded.fetch_add(count);
  }

  pub fn increment_instants_skipped(&self) {
    self.instants_skipped.fetch_add(1);
  }

  pub fn increment_samples_appended(&self) {
    self.samples_appended.fetch_add(1);
  }

  pub fn increment_blocks_created(&self) {
    self.blocks_created.fetch_add(1);
  }

  pub fn get_queries(&self) -> u64 {
    self.queries.load()
  }

  pub fn get_query_failures(&self) -> u64 {
    self.query_failures.load()
  }

  pub fn get_query_duration_millis(&self) -> u64 {
    self.query_duration_millis.load()
  }

  pub fn get_samples_loaded(&self) -> u64 {
    self.samples_loaded.load()
  }

  pub fn get_instants_skipped(&self) -> u64 {
    self.instants_skipped.load()
  }

  pub fn get_samples_appended(&self) -> u64 {
    self.samples_appended.load()
  }

  pub fn get_blocks_created(&self) -> u64 {
    self.blocks_created.load()
  }
}

impl Default for BackfillMetrics {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for BackfillMetrics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      concat!(
        "queries={} query_failures={} query_duration_ms={} samples_loaded={} ",
        "instants_skipped={} samples_appended={} blocks_created={}"
      ),
      self.get_queries(),
      self.get_query_failures(),
      self.get_query_duration_millis(),
      self.get_samples_loaded(),
      self.get_instants_skipped(),
      self.get_samples_appended(),
      self.get_blocks_created()
    )
  }
}
