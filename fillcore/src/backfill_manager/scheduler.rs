// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};
use serde::Deserialize;
use uuid::Uuid;

use crate::backfill_manager::flusher::BatchFlusher;
use crate::backfill_manager::metrics::BackfillMetrics;
use crate::backfill_manager::relabel::relabel;
use crate::backfill_manager::time_range::TimeRange;
use crate::query_manager::engine::QueryFunc;
use crate::rule_manager::recording_rule::RecordingRule;
use crate::utils::error::BackfillError;
use crate::utils::sync::Arc;

/// What the scheduler does when a query fails at one instant.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryErrorPolicy {
  /// Log the failure and continue with the next instant.
  Skip,

  /// Fail the whole run.
  Abort,
}

impl FromStr for QueryErrorPolicy {
  type Err = BackfillError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "skip" => Ok(QueryErrorPolicy::Skip),
      "abort" => Ok(QueryErrorPolicy::Abort),
      _ => Err(BackfillError::InvalidConfiguration(format!(
        "Unknown query error policy {:?}, expected \"skip\" or \"abort\"",
        s
      ))),
    }
  }
}

impl fmt::Display for QueryErrorPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      QueryErrorPolicy::Skip => write!(f, "skip"),
      QueryErrorPolicy::Abort => write!(f, "abort"),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
  Idle,
  Running,
  Completed,
  Failed,
}

impl fmt::Display for SchedulerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// Outcome of a completed run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
  rules: usize,
  instants: usize,
  failed_instants: usize,
  samples: usize,
  blocks: Vec<Uuid>,
}

impl RunSummary {
  pub fn get_rules(&self) -> usize {
    self.rules
  }

  /// Number of evaluation instants, across all rules.
  pub fn get_instants(&self) -> usize {
    self.instants
  }

  pub fn get_failed_instants(&self) -> usize {
    self.failed_instants
  }

  /// Number of samples recorded.
  pub fn get_samples(&self) -> usize {
    self.samples
  }

  /// Ids of the blocks created, oldest first.
  pub fn get_blocks(&self) -> &Vec<Uuid> {
    &self.blocks
  }
}

impl fmt::Display for RunSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "rules={} instants={} failed_instants={} samples={} blocks={}",
      self.rules,
      self.instants,
      self.failed_instants,
      self.samples,
      self.blocks.len()
    )
  }
}

/// Walks every rule over the time range and feeds the recorded samples to a flusher.
/// A scheduler runs at most once.
pub struct EvaluationScheduler<'a> {
  query_func: &'a dyn QueryFunc,
  default_interval: i64,
  on_query_error: QueryErrorPolicy,
  metrics: Arc<BackfillMetrics>,
  state: SchedulerState,
}

impl<'a> EvaluationScheduler<'a> {
  pub fn new(
    query_func: &'a dyn QueryFunc,
    default_interval: i64,
    on_query_error: QueryErrorPolicy,
    metrics: Arc<BackfillMetrics>,
  ) -> Result<Self, BackfillError> {
    if default_interval <= 0 {
      return Err(BackfillError::InvalidConfiguration(format!(
        "Evaluation interval must be positive, got {}ms",
        default_interval
      )));
    }

    Ok(EvaluationScheduler {
      query_func,
      default_interval,
      on_query_error,
      metrics,
      state: SchedulerState::Idle,
    })
  }

  pub fn get_state(&self) -> SchedulerState {
    self.state
  }

  /// Evaluate every rule, in order, at every instant of the range, and flush whatever is left in
  /// the batch at the end.
  pub fn run(
    &mut self,
    rules: &[RecordingRule],
    range: TimeRange,
    flusher: &mut BatchFlusher,
  ) -> Result<RunSummary, BackfillError> {
    if self.state != SchedulerState::Idle {
      return Err(BackfillError::InvalidSchedulerState(self.state.to_string()));
    }
    self.state = SchedulerState::Running;

    match self.run_rules(rules, range, flusher) {
      Ok(summary) => {
        self.state = SchedulerState::Completed;
        info!("Backfill completed: {}", summary);
        Ok(summary)
      }
      Err(e) => {
        self.state = SchedulerState::Failed;
        Err(e)
      }
    }
  }

  fn run_rules(
    &self,
    rules: &[RecordingRule],
    range: TimeRange,
    flusher: &mut BatchFlusher,
  ) -> Result<RunSummary, BackfillError> {
    let mut summary = RunSummary {
      rules: rules.len(),
      ..Default::default()
    };

    for rule in rules {
      let step = rule.get_interval().unwrap_or(self.default_interval);
      if step <= 0 {
        return Err(BackfillError::InvalidConfiguration(format!(
          "Evaluation interval for rule {} must be positive, got {}ms",
          rule.get_name(),
          step
        )));
      }
      info!(
        "Processing rule {} of group {:?} every {}ms",
        rule.get_name(),
        rule.get_group_name(),
        step
      );

      let mut time = range.get_start().checked_add(step);
      while let Some(t) = time.filter(|t| *t <= range.get_end()) {
        summary.instants += 1;
        self.evaluate_at(rule, t, flusher, &mut summary)?;
        time = t.checked_add(step);
      }
    }

    flusher.flush()?;
    summary.blocks = flusher.get_blocks().clone();
    Ok(summary)
  }

  fn evaluate_at(
    &self,
    rule: &RecordingRule,
    time: i64,
    flusher: &mut BatchFlusher,
    summary: &mut RunSummary,
  ) -> Result<(), BackfillError> {
    let results = match self.query_func.evaluate(rule.get_expr(), time) {
      Ok(results) => results,
      Err(cause) => match self.on_query_error {
        QueryErrorPolicy::Skip => {
          warn!(
            "Skipping rule {} at time {}: {}",
            rule.get_name(),
            time,
            cause
          );
          summary.failed_instants += 1;
          self.metrics.increment_instants_skipped();
          return Ok(());
        }
        QueryErrorPolicy::Abort => {
          return Err(BackfillError::QueryFailed {
            rule: rule.get_name().to_owned(),
            time,
            cause,
          })
        }
      },
    };

    debug!(
      "Rule {} at time {} returned {} results",
      rule.get_name(),
      time,
      results.len()
    );
    for raw in results {
      flusher.append(relabel(raw, rule, time))?;
      summary.samples += 1;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use test_case::test_case;

  use super::*;
  use crate::metric::labels::Labels;
  use crate::metric::sample::Sample;
  use crate::query_manager::engine::RawResult;
  use crate::storage_manager::block::BlockWriter;
  use crate::utils::error::QueryError;
  use crate::utils::sync::Mutex;

  /// Keeps the samples of every block in memory.
  #[derive(Default)]
  struct MemoryWriter {
    blocks: Mutex<Vec<Vec<Sample>>>,
  }

  impl BlockWriter for MemoryWriter {
    fn create_block(
      &self,
      samples: &[Sample],
      _dest_dir_path: &str,
      _min_time: i64,
      _max_time: i64,
    ) -> Result<Uuid, BackfillError> {
      self.blocks.lock().push(samples.to_vec());
      Ok(Uuid::new_v4())
    }
  }

  fn rule(name: &str, expr: &str, interval: Option<i64>) -> RecordingRule {
    RecordingRule::new(name, expr, BTreeMap::new(), interval, "g")
  }

  fn run_with<F>(
    query_func: F,
    rules: &[RecordingRule],
    range: TimeRange,
    policy: QueryErrorPolicy,
  ) -> (Result<RunSummary, BackfillError>, Vec<Vec<Sample>>)
  where
    F: Fn(&str, i64) -> Result<Vec<RawResult>, QueryError>,
  {
    let writer = MemoryWriter::default();
    let metrics = Arc::new(BackfillMetrics::new());
    let mut flusher = BatchFlusher::new(&writer, "dest", 100, metrics.clone()).unwrap();
    let mut scheduler = EvaluationScheduler::new(&query_func, 30_000, policy, metrics).unwrap();
    let result = scheduler.run(rules, range, &mut flusher);
    let blocks = writer.blocks.lock().clone();
    (result, blocks)
  }

  fn one_result(_expr: &str, _time: i64) -> Result<Vec<RawResult>, QueryError> {
    Ok(vec![RawResult::new(Labels::new(), 1.0)])
  }

  #[test]
  fn test_instants() {
    let calls = Mutex::new(Vec::new());
    let query_func = |expr: &str, time: i64| -> Result<Vec<RawResult>, QueryError> {
      calls.lock().push((expr.to_owned(), time));
      one_result(expr, time)
    };

    let rules = vec![rule("a", "up", None), rule("b", "down", Some(45_000))];
    let range = TimeRange::new(0, 100_000).unwrap();
    let (result, blocks) = run_with(query_func, &rules, range, QueryErrorPolicy::Skip);

    let summary = result.unwrap();
    assert_eq!(summary.get_rules(), 2);
    assert_eq!(summary.get_instants(), 5);
    assert_eq!(summary.get_samples(), 5);
    assert_eq!(summary.get_blocks().len(), 1);

    // Rule order first, then chronological.
    assert_eq!(
      *calls.lock(),
      vec![
        ("up".to_owned(), 30_000),
        ("up".to_owned(), 60_000),
        ("up".to_owned(), 90_000),
        ("down".to_owned(), 45_000),
        ("down".to_owned(), 90_000),
      ]
    );

    let names: Vec<&str> = blocks[0]
      .iter()
      .map(|s| s.get_labels().get_metric_name().unwrap())
      .collect();
    assert_eq!(names, vec!["a", "a", "a", "b", "b"]);
  }

  #[test]
  fn test_range_shorter_than_step() {
    let range = TimeRange::new(0, 29_999).unwrap();
    let (result, blocks) = run_with(
      one_result,
      &[rule("a", "up", None)],
      range,
      QueryErrorPolicy::Skip,
    );
    let summary = result.unwrap();
    assert_eq!(summary.get_instants(), 0);
    assert!(summary.get_blocks().is_empty());
    assert!(blocks.is_empty());
  }

  fn fail_at_60s(_expr: &str, time: i64) -> Result<Vec<RawResult>, QueryError> {
    if time == 60_000 {
      Err(QueryError::Timeout("slow".to_owned()))
    } else {
      Ok(vec![RawResult::new(Labels::new(), time as f64)])
    }
  }

  #[test]
  fn test_skip_failed_instants() {
    let range = TimeRange::new(0, 100_000).unwrap();
    let (result, blocks) = run_with(
      fail_at_60s,
      &[rule("a", "up", None)],
      range,
      QueryErrorPolicy::Skip,
    );

    let summary = result.unwrap();
    assert_eq!(summary.get_instants(), 3);
    assert_eq!(summary.get_failed_instants(), 1);
    let times: Vec<i64> = blocks[0].iter().map(|s| s.get_time()).collect();
    assert_eq!(times, vec![30_000, 90_000]);
  }

  #[test]
  fn test_abort_on_failure() {
    let range = TimeRange::new(0, 100_000).unwrap();
    let (result, blocks) = run_with(
      fail_at_60s,
      &[rule("a", "up", None)],
      range,
      QueryErrorPolicy::Abort,
    );

    assert_eq!(
      result,
      Err(BackfillError::QueryFailed {
        rule: "a".to_owned(),
        time: 60_000,
        cause: QueryError::Timeout("slow".to_owned()),
      })
    );
    // Nothing is flushed after a failure.
    assert!(blocks.is_empty());
  }

  #[test]
  fn test_runs_once() {
    let writer = MemoryWriter::default();
    let metrics = Arc::new(BackfillMetrics::new());
    let mut flusher = BatchFlusher::new(&writer, "dest", 10, metrics.clone()).unwrap();
    let query_func = one_result;
    let mut scheduler =
      EvaluationScheduler::new(&query_func, 30_000, QueryErrorPolicy::Skip, metrics).unwrap();
    assert_eq!(scheduler.get_state(), SchedulerState::Idle);

    let range = TimeRange::new(0, 60_000).unwrap();
    scheduler.run(&[], range, &mut flusher).unwrap();
    assert_eq!(scheduler.get_state(), SchedulerState::Completed);
    assert_eq!(
      scheduler.run(&[], range, &mut flusher),
      Err(BackfillError::InvalidSchedulerState("Completed".to_owned()))
    );
  }

  #[test_case(0; "zero")]
  #[test_case(-1; "negative")]
  fn test_invalid_interval(interval: i64) {
    let query_func = one_result;
    let metrics = Arc::new(BackfillMetrics::new());
    assert!(matches!(
      EvaluationScheduler::new(&query_func, interval, QueryErrorPolicy::Skip, metrics.clone()),
      Err(BackfillError::InvalidConfiguration(_))
    ));

    // A group interval can be invalid even when the default is fine.
    let range = TimeRange::new(0, 60_000).unwrap();
    let (result, _) = run_with(
      one_result,
      &[rule("a", "up", Some(interval))],
      range,
      QueryErrorPolicy::Skip,
    );
    assert!(matches!(result, Err(BackfillError::InvalidConfiguration(_))));
  }

  #[test_case("skip", QueryErrorPolicy::Skip; "skip")]
  #[test_case("ABORT", QueryErrorPolicy::Abort; "abort")]
  fn test_parse_policy(input: &str, expected: QueryErrorPolicy) {
    assert_eq!(input.parse::<QueryErrorPolicy>().unwrap(), expected);
  }

  #[test]
  fn test_parse_unknown_policy() {
    assert!("retry".parse::<QueryErrorPolicy>().is_err());
  }
}
