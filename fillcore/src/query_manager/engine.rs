// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Evaluate a PromQL expression at a single instant.
//!
//! The engine walks the parsed [Expr] tree recursively, loading data from a [Queryable] store
//! for selectors and combining the results bottom up. Each evaluation is bounded by a sample
//! budget and a wall clock timeout, and can be recorded in a query log.

use std::collections::HashMap;

use log::{debug, warn};

use crate::backfill_manager::metrics::BackfillMetrics;
use crate::metric::labels::Labels;
use crate::metric::matcher::LabelMatcher;
use crate::metric::sample::Sample;
use crate::metric::constants::{MetricsQueryCondition, METRIC_NAME_LABEL};
use crate::query_manager::ast::{
  string_value, BinaryOperator, Expr, FunctionOperator, ValueType, VectorMatching,
  VectorSelector,
};
use crate::query_manager::parser::parse_expr;
use crate::query_manager::promql_time_series::PromQLTimeSeries;
use crate::query_manager::promql_vector::{binary_value, PromQLVector};
use crate::query_manager::query_log::QueryLogger;
use crate::utils::config::QuerySettings;
use crate::utils::error::{BackfillError, QueryError};
use crate::utils::sync::{Arc, Mutex};
use crate::utils::time::get_current_time_in_millis;

/// One element of a query result: the labels of a series and its value at the evaluation time.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResult {
  labels: Labels,
  value: f64,
}

impl RawResult {
  pub fn new(labels: Labels, value: f64) -> Self {
    RawResult { labels, value }
  }

  pub fn get_labels(&self) -> &Labels {
    &self.labels
  }

  pub fn get_value(&self) -> f64 {
    self.value
  }

  pub fn into_labels(self) -> Labels {
    self.labels
  }
}

/// A store that can be read by the query engine.
pub trait Queryable {
  /// Return every series matching all the matchers, with its points in `[min_time, max_time]`
  /// sorted by time. Series without points in the range may be omitted.
  fn select(&self, matchers: &[LabelMatcher], min_time: i64, max_time: i64)
    -> Vec<PromQLTimeSeries>;
}

/// Evaluate an expression at an instant. This is the only view the scheduler has of the query
/// engine, so tests and other backends can be swapped in.
pub trait QueryFunc {
  fn evaluate(&self, expr: &str, time: i64) -> Result<Vec<RawResult>, QueryError>;
}

impl<F> QueryFunc for F
where
  F: Fn(&str, i64) -> Result<Vec<RawResult>, QueryError>,
{
  fn evaluate(&self, expr: &str, time: i64) -> Result<Vec<RawResult>, QueryError> {
    self(expr, time)
  }
}

/// The value of an evaluated expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
  Scalar(f64),
  Vector(PromQLVector),
  Matrix {
    series: Vec<PromQLTimeSeries>,
    range_start: i64,
    range_end: i64,
  },
}

/// PromQL engine reading from a [Queryable] store.
pub struct PromQLEngine<'a, Q: Queryable> {
  queryable: &'a Q,

  /// Maximum number of samples a single query may load.
  max_samples: usize,

  /// Maximum wall time of a single query, in milliseconds.
  timeout: i64,

  /// How far back an instant selector looks for the latest point, in milliseconds.
  lookback_delta: i64,

  query_logger: Option<Mutex<QueryLogger>>,

  /// Parsed expressions, keyed by their text. Rules are evaluated at many instants.
  parsed: Mutex<HashMap<String, Arc<Expr>>>,

  metrics: Arc<BackfillMetrics>,
}

impl<'a, Q: Queryable> PromQLEngine<'a, Q> {
  pub fn new(
    queryable: &'a Q,
    max_samples: usize,
    timeout: i64,
    lookback_delta: i64,
    metrics: Arc<BackfillMetrics>,
  ) -> Self {
    PromQLEngine {
      queryable,
      max_samples,
      timeout,
      lookback_delta,
      query_logger: None,
      parsed: Mutex::new(HashMap::new()),
      metrics,
    }
  }

  /// Create an engine from the query settings, opening the query log if one is configured.
  pub fn from_settings(
    queryable: &'a Q,
    settings: &QuerySettings,
    metrics: Arc<BackfillMetrics>,
  ) -> Result<Self, BackfillError> {
    let engine = Self::new(
      queryable,
      settings.get_max_samples(),
      settings.get_timeout(),
      settings.get_lookback_delta(),
      metrics,
    );
    match settings.get_query_log_file() {
      Some(path) => engine.with_query_log(path),
      None => Ok(engine),
    }
  }

  /// Append a JSON line to the given file for every executed query.
  pub fn with_query_log(mut self, path: &str) -> Result<Self, BackfillError> {
    self.query_logger = Some(Mutex::new(QueryLogger::new(path)?));
    Ok(self)
  }

  /// Parse the expression, or return the cached parse.
  fn parse(&self, query: &str) -> Result<Arc<Expr>, QueryError> {
    let mut parsed = self.parsed.lock();
    if let Some(expr) = parsed.get(query) {
      return Ok(expr.clone());
    }
    let expr = Arc::new(parse_expr(query)?);
    parsed.insert(query.to_owned(), expr.clone());
    Ok(expr)
  }

  /// Evaluate an expression at the given time and return its value.
  pub fn query(&self, query: &str, time: i64) -> Result<Value, QueryError> {
    let expr = self.parse(query)?;
    let start_time = get_current_time_in_millis();
    let mut evaluator = Evaluator {
      queryable: self.queryable,
      time,
      lookback_delta: self.lookback_delta,
      max_samples: self.max_samples,
      samples_loaded: 0,
      timeout: self.timeout,
      deadline: start_time.saturating_add(self.timeout),
    };

    let result = evaluator.eval(&expr);
    self.metrics.add_samples_loaded(evaluator.samples_loaded as u64);
    result
  }

  fn log_query(&self, query: &str, time: i64, duration_ms: u64, error: Option<String>) {
    if let Some(logger) = &self.query_logger {
      if let Err(e) = logger.lock().log(query, time, duration_ms, error) {
        warn!("Could not write to the query log: {}", e);
      }
    }
  }
}

impl<'a, Q: Queryable> QueryFunc for PromQLEngine<'a, Q> {
  fn evaluate(&self, expr: &str, time: i64) -> Result<Vec<RawResult>, QueryError> {
    let start_time = get_current_time_in_millis();

    let result = self.query(expr, time).and_then(|value| match value {
      Value::Scalar(value) => Ok(vec![RawResult::new(Labels::new(), value)]),
      Value::Vector(vector) => {
        vector.check_unique_labels()?;
        Ok(
          vector
            .into_vector()
            .into_iter()
            .map(|sample| {
              let value = sample.get_value();
              RawResult::new(sample.into_labels(), value)
            })
            .collect(),
        )
      }
      Value::Matrix { .. } => Err(QueryError::BadExpression(
        "expression must evaluate to a scalar or an instant vector".to_owned(),
      )),
    });

    let duration_ms = (get_current_time_in_millis() - start_time).max(0) as u64;
    self.metrics.record_query(duration_ms, result.is_err());
    self.log_query(
      expr,
      time,
      duration_ms,
      result.as_ref().err().map(|e| e.to_string()),
    );
    debug!(
      "Evaluated {:?} at {} in {}ms: {} results",
      expr,
      time,
      duration_ms,
      result.as_ref().map(|r| r.len()).unwrap_or(0)
    );

    result
  }
}

/// State of a single evaluation.
struct Evaluator<'q, Q: Queryable> {
  queryable: &'q Q,
  time: i64,
  lookback_delta: i64,
  max_samples: usize,
  samples_loaded: usize,
  timeout: i64,
  deadline: i64,
}

impl<'q, Q: Queryable> Evaluator<'q, Q> {
  fn check_deadline(&self) -> Result<(), QueryError> {
    if get_current_time_in_millis() > self.deadline {
      return Err(QueryError::Timeout(format!(
        "query exceeded the timeout of {}ms",
        self.timeout
      )));
    }
    Ok(())
  }

  fn add_samples_loaded(&mut self, count: usize) -> Result<(), QueryError> {
    self.samples_loaded += count;
    if self.samples_loaded > self.max_samples {
      return Err(QueryError::TooManySamples(self.max_samples));
    }
    Ok(())
  }

  fn eval(&mut self, expr: &Expr) -> Result<Value, QueryError> {
    self.check_deadline()?;

    match expr {
      Expr::NumberLiteral(value) => Ok(Value::Scalar(*value)),
      Expr::StringLiteral(_) => Err(unexpected_type("scalar or vector", "string")),
      Expr::Paren(inner) => self.eval(inner),
      Expr::VectorSelector(selector) => Ok(Value::Vector(self.select_instant(selector)?)),
      Expr::MatrixSelector { selector, range } => self.select_range(selector, *range),
      Expr::Negation(inner) => match self.eval(inner)? {
        Value::Scalar(value) => Ok(Value::Scalar(-value)),
        Value::Vector(mut vector) => {
          vector.negate();
          vector.set_time(self.time);
          Ok(Value::Vector(vector))
        }
        Value::Matrix { .. } => Err(unexpected_type("unary expression", "range vector")),
      },
      Expr::Aggregation {
        op,
        param,
        expr,
        grouping,
      } => {
        let param = match param {
          Some(param) => Some(self.eval_scalar(param)?),
          None => None,
        };
        let vector = self.eval_vector(expr)?;
        Ok(Value::Vector(vector.aggregate(
          *op,
          param,
          grouping.as_ref(),
          self.time,
        )))
      }
      Expr::FunctionCall { func, args } => self.eval_function(*func, args),
      Expr::Binary {
        op,
        lhs,
        rhs,
        return_bool,
        matching,
      } => {
        let lhs = self.eval(lhs)?;
        let rhs = self.eval(rhs)?;
        self.eval_binary(*op, lhs, rhs, *return_bool, matching.as_ref())
      }
    }
  }

  fn eval_scalar(&mut self, expr: &Expr) -> Result<f64, QueryError> {
    match self.eval(expr)? {
      Value::Scalar(value) => Ok(value),
      Value::Vector(_) => Err(unexpected_type("scalar", "instant vector")),
      Value::Matrix { .. } => Err(unexpected_type("scalar", "range vector")),
    }
  }

  fn eval_vector(&mut self, expr: &Expr) -> Result<PromQLVector, QueryError> {
    match self.eval(expr)? {
      Value::Vector(vector) => Ok(vector),
      Value::Scalar(_) => Err(unexpected_type("instant vector", "scalar")),
      Value::Matrix { .. } => Err(unexpected_type("instant vector", "range vector")),
    }
  }

  /// The latest point of every matching series within the lookback window
  /// `(t - offset - lookback, t - offset]`.
  fn select_instant(&mut self, selector: &VectorSelector) -> Result<PromQLVector, QueryError> {
    let reference_time = self.time - selector.offset;
    let series = self.queryable.select(
      &selector.matchers,
      reference_time - self.lookback_delta + 1,
      reference_time,
    );
    self.check_deadline()?;

    let mut samples = Vec::new();
    for ts in series {
      if let Some(last) = ts.get_metric_points().last().cloned() {
        samples.push(Sample::new(
          ts.into_labels(),
          last.get_time(),
          last.get_value(),
        ));
      }
    }
    self.add_samples_loaded(samples.len())?;

    Ok(PromQLVector::new(samples))
  }

  /// Every point of every matching series in `(t - offset - range, t - offset]`.
  fn select_range(&mut self, selector: &VectorSelector, range: i64) -> Result<Value, QueryError> {
    let range_end = self.time - selector.offset;
    let range_start = range_end - range;
    let series: Vec<PromQLTimeSeries> = self
      .queryable
      .select(&selector.matchers, range_start + 1, range_end)
      .into_iter()
      .filter(|ts| !ts.is_empty())
      .collect();
    self.check_deadline()?;

    let count = series.iter().map(|ts| ts.get_metric_points().len()).sum();
    self.add_samples_loaded(count)?;

    Ok(Value::Matrix {
      series,
      range_start,
      range_end,
    })
  }

  fn eval_function(&mut self, func: FunctionOperator, args: &[Expr]) -> Result<Value, QueryError> {
    match func {
      FunctionOperator::Time => return Ok(Value::Scalar(self.time as f64 / 1000.0)),
      FunctionOperator::Vector => {
        let value = self.eval_scalar(arg(args, 0)?)?;
        return Ok(Value::Vector(PromQLVector::new(vec![Sample::new(
          Labels::new(),
          self.time,
          value,
        )])));
      }
      FunctionOperator::Scalar => {
        let vector = self.eval_vector(arg(args, 0)?)?;
        let value = match vector.get_vector().as_slice() {
          [sample] => sample.get_value(),
          _ => f64::NAN,
        };
        return Ok(Value::Scalar(value));
      }
      FunctionOperator::HistogramQuantile => {
        let phi = self.eval_scalar(arg(args, 0)?)?;
        let vector = self.eval_vector(arg(args, 1)?)?;
        return Ok(Value::Vector(vector.histogram_quantile(phi, self.time)));
      }
      _ => {}
    }

    if func.signature().0.first() == Some(&ValueType::Matrix) {
      let (series, range_start, range_end) = match self.eval(arg(args, 0)?)? {
        Value::Matrix {
          series,
          range_start,
          range_end,
        } => (series, range_start, range_end),
        Value::Scalar(_) => return Err(unexpected_type("range vector", "scalar")),
        Value::Vector(_) => return Err(unexpected_type("range vector", "instant vector")),
      };

      let mut samples = Vec::new();
      for ts in series {
        if let Some(value) = apply_range_function(func, &ts, range_start, range_end) {
          let mut labels = ts.into_labels();
          if func != FunctionOperator::LastOverTime {
            labels.remove_metric_name();
          }
          samples.push(Sample::new(labels, self.time, value));
        }
      }
      let vector = PromQLVector::new(samples);
      vector.check_unique_labels()?;
      return Ok(Value::Vector(vector));
    }

    let mut vector = self.eval_vector(arg(args, 0)?)?;
    match func {
      FunctionOperator::Abs => vector.apply_function(f64::abs),
      FunctionOperator::Ceil => vector.apply_function(f64::ceil),
      FunctionOperator::Floor => vector.apply_function(f64::floor),
      FunctionOperator::Sqrt => vector.apply_function(f64::sqrt),
      FunctionOperator::Exp => vector.apply_function(f64::exp),
      FunctionOperator::Ln => vector.apply_function(f64::ln),
      FunctionOperator::Log2 => vector.apply_function(f64::log2),
      FunctionOperator::Log10 => vector.apply_function(f64::log10),
      FunctionOperator::ClampMin => {
        let min = self.eval_scalar(arg(args, 1)?)?;
        vector.apply_function(|v| v.max(min));
      }
      FunctionOperator::ClampMax => {
        let max = self.eval_scalar(arg(args, 1)?)?;
        vector.apply_function(|v| v.min(max));
      }
      FunctionOperator::Round => {
        let to_nearest = match args.get(1) {
          Some(expr) => self.eval_scalar(expr)?,
          None => 1.0,
        };
        vector.round(to_nearest);
      }
      FunctionOperator::LabelReplace => {
        vector.label_replace(
          string_arg(args, 1)?,
          string_arg(args, 2)?,
          string_arg(args, 3)?,
          string_arg(args, 4)?,
        )?;
      }
      FunctionOperator::LabelJoin => {
        let src = (3..args.len())
          .map(|index| string_arg(args, index))
          .collect::<Result<Vec<&str>, QueryError>>()?;
        vector.label_join(string_arg(args, 1)?, string_arg(args, 2)?, &src);
      }
      FunctionOperator::Absent => {
        let samples = if vector.is_empty() {
          vec![Sample::new(absent_labels(arg(args, 0)?), self.time, 1.0)]
        } else {
          Vec::new()
        };
        vector = PromQLVector::new(samples);
      }
      FunctionOperator::Timestamp => {
        // Only a plain selector carries the times of the stored points.
        if !is_vector_selector(arg(args, 0)?) {
          vector.set_time(self.time);
        }
        vector.timestamp();
      }
      other => {
        return Err(QueryError::Internal(format!(
          "function {:?} is not an instant vector function",
          other
        )))
      }
    }

    vector.set_time(self.time);
    vector.check_unique_labels()?;
    Ok(Value::Vector(vector))
  }

  fn eval_binary(
    &mut self,
    op: BinaryOperator,
    lhs: Value,
    rhs: Value,
    return_bool: bool,
    matching: Option<&VectorMatching>,
  ) -> Result<Value, QueryError> {
    match (lhs, rhs) {
      (Value::Scalar(lhs), Value::Scalar(rhs)) => {
        let (value, keep) = binary_value(op, lhs, rhs);
        if op.is_comparison() {
          Ok(Value::Scalar(if keep { 1.0 } else { 0.0 }))
        } else {
          Ok(Value::Scalar(value))
        }
      }
      (Value::Vector(lhs), Value::Scalar(rhs)) => Ok(Value::Vector(
        self.at_time(lhs.binary_with_scalar(op, rhs, false, return_bool)),
      )),
      (Value::Scalar(lhs), Value::Vector(rhs)) => Ok(Value::Vector(
        self.at_time(rhs.binary_with_scalar(op, lhs, true, return_bool)),
      )),
      (Value::Vector(lhs), Value::Vector(rhs)) => {
        let result = match op {
          BinaryOperator::And => lhs.and(&rhs, matching),
          BinaryOperator::Or => lhs.or(&rhs, matching),
          BinaryOperator::Unless => lhs.unless(&rhs, matching),
          _ => lhs.binary_with_vector(op, &rhs, matching, return_bool)?,
        };
        Ok(Value::Vector(self.at_time(result)))
      }
      _ => Err(unexpected_type(
        "scalar or instant vector",
        "range vector",
      )),
    }
  }

  fn at_time(&self, mut vector: PromQLVector) -> PromQLVector {
    vector.set_time(self.time);
    vector
  }
}

fn apply_range_function(
  func: FunctionOperator,
  ts: &PromQLTimeSeries,
  range_start: i64,
  range_end: i64,
) -> Option<f64> {
  match func {
    FunctionOperator::Rate => ts.rate(range_start, range_end),
    FunctionOperator::Increase => ts.increase(range_start, range_end),
    FunctionOperator::Delta => ts.delta(range_start, range_end),
    FunctionOperator::Irate => ts.irate(),
    FunctionOperator::AvgOverTime => ts.avg_over_time(),
    FunctionOperator::SumOverTime => ts.sum_over_time(),
    FunctionOperator::MinOverTime => ts.min_over_time(),
    FunctionOperator::MaxOverTime => ts.max_over_time(),
    FunctionOperator::CountOverTime => ts.count_over_time(),
    FunctionOperator::LastOverTime => ts.last_over_time(),
    FunctionOperator::StddevOverTime => ts.stddev_over_time(),
    FunctionOperator::Changes => ts.changes(),
    FunctionOperator::Resets => ts.resets(),
    FunctionOperator::Deriv => ts.deriv(),
    FunctionOperator::StdvarOverTime => ts.stdvar_over_time(),
    _ => None,
  }
}

fn arg(args: &[Expr], index: usize) -> Result<&Expr, QueryError> {
  args
    .get(index)
    .ok_or_else(|| QueryError::BadExpression(format!("missing argument {}", index + 1)))
}

fn string_arg(args: &[Expr], index: usize) -> Result<&str, QueryError> {
  string_value(arg(args, index)?)
    .ok_or_else(|| QueryError::BadExpression(format!("argument {} must be a string", index + 1)))
}

fn vector_selector(expr: &Expr) -> Option<&VectorSelector> {
  match expr {
    Expr::VectorSelector(selector) => Some(selector),
    Expr::Paren(inner) => vector_selector(inner),
    _ => None,
  }
}

fn is_vector_selector(expr: &Expr) -> bool {
  vector_selector(expr).is_some()
}

/// Labels of the sample returned by `absent()`: the equality matchers of a plain selector,
/// except the metric name and any label matched more than once.
fn absent_labels(expr: &Expr) -> Labels {
  let mut labels = Labels::new();
  let selector = match vector_selector(expr) {
    Some(selector) => selector,
    None => return labels,
  };

  for matcher in &selector.matchers {
    let name = matcher.get_label_name();
    let occurrences = selector
      .matchers
      .iter()
      .filter(|m| m.get_label_name() == name)
      .count();
    if name != METRIC_NAME_LABEL
      && occurrences == 1
      && matcher.get_condition() == MetricsQueryCondition::Equals
    {
      labels.set(name, matcher.get_label_value());
    }
  }
  labels
}

fn unexpected_type(expected: &str, got: &str) -> QueryError {
  QueryError::BadExpression(format!("expected {}, got {}", expected, got))
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::thread;
  use std::time::Duration;

  use tempdir::TempDir;

  use super::*;
  use crate::metric::matcher::matches_all;
  use crate::metric::metric_point::MetricPoint;
  use crate::query_manager::query_log::QueryLogEntry;
  use crate::utils::io::get_joined_path;

  /// Series kept in memory, for testing.
  struct MemoryQueryable {
    series: Vec<PromQLTimeSeries>,
    delay: Option<Duration>,
  }

  impl MemoryQueryable {
    fn new() -> Self {
      MemoryQueryable {
        series: Vec::new(),
        delay: None,
      }
    }

    fn add(&mut self, labels: &[(&str, &str)], points: &[(i64, f64)]) {
      self.series.push(PromQLTimeSeries::new(
        labels.iter().copied().collect(),
        points
          .iter()
          .map(|(t, v)| MetricPoint::new(*t, *v))
          .collect(),
      ));
    }
  }

  impl Queryable for MemoryQueryable {
    fn select(
      &self,
      matchers: &[LabelMatcher],
      min_time: i64,
      max_time: i64,
    ) -> Vec<PromQLTimeSeries> {
      if let Some(delay) = self.delay {
        thread::sleep(delay);
      }
      self
        .series
        .iter()
        .filter(|ts| matches_all(matchers, ts.get_labels()))
        .map(|ts| {
          PromQLTimeSeries::new(
            ts.get_labels().clone(),
            ts.get_metric_points()
              .iter()
              .filter(|mp| mp.get_time() >= min_time && mp.get_time() <= max_time)
              .cloned()
              .collect(),
          )
        })
        .collect()
    }
  }

  /// Two counters of one request per second, and one of ten requests per second, scraped
  /// every 15 seconds for 10 minutes.
  fn http_requests() -> MemoryQueryable {
    let mut queryable = MemoryQueryable::new();
    for (job, instance, per_second) in [("api", "a", 1.0), ("api", "b", 1.0), ("db", "c", 10.0)] {
      let points: Vec<(i64, f64)> = (0..=40)
        .map(|i| (i * 15_000, i as f64 * 15.0 * per_second))
        .collect();
      queryable.add(
        &[
          ("__name__", "http_requests_total"),
          ("job", job),
          ("instance", instance),
        ],
        &points,
      );
    }
    queryable
  }

  fn new_engine(queryable: &MemoryQueryable) -> PromQLEngine<'_, MemoryQueryable> {
    PromQLEngine::new(
      queryable,
      50_000_000,
      120_000,
      300_000,
      Arc::new(BackfillMetrics::new()),
    )
  }

  fn sorted_values(results: &[RawResult]) -> Vec<(String, f64)> {
    let mut values: Vec<(String, f64)> = results
      .iter()
      .map(|r| (r.get_labels().to_string(), r.get_value()))
      .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
  }

  #[test]
  fn test_instant_selector() {
    let queryable = http_requests();
    let engine = new_engine(&queryable);

    let results = engine
      .evaluate("http_requests_total{job=\"api\"}", 300_000)
      .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.get_value() == 300.0));
    assert_eq!(
      results[0].get_labels().get_metric_name(),
      Some("http_requests_total")
    );

    // Points are found within the lookback window only.
    let results = engine
      .evaluate("http_requests_total{job=\"db\"}", 600_000 + 299_999)
      .unwrap();
    assert_eq!(results.len(), 1);
    let results = engine
      .evaluate("http_requests_total{job=\"db\"}", 600_000 + 300_000)
      .unwrap();
    assert!(results.is_empty());

    // Offset moves the reference time back.
    let results = engine
      .evaluate("http_requests_total{job=\"db\"} offset 1m", 300_000)
      .unwrap();
    assert_eq!(results[0].get_value(), 2400.0);
  }

  #[test]
  fn test_sum_of_rates() {
    let queryable = http_requests();
    let engine = new_engine(&queryable);

    let results = engine
      .evaluate("sum by (job) (rate(http_requests_total[1m]))", 300_000)
      .unwrap();
    let values = sorted_values(&results);
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].0, "{job=\"api\"}");
    assert!((values[0].1 - 2.0).abs() < 1e-9);
    assert_eq!(values[1].0, "{job=\"db\"}");
    assert!((values[1].1 - 10.0).abs() < 1e-9);
  }

  #[test]
  fn test_binary_operations() {
    let queryable = http_requests();
    let engine = new_engine(&queryable);

    let results = engine
      .evaluate("http_requests_total / 15 > 100", 150_000)
      .unwrap();
    assert!(results.is_empty());

    let results = engine
      .evaluate("http_requests_total / 15 >= 100", 150_000)
      .unwrap();
    assert_eq!(
      sorted_values(&results),
      vec![("{instance=\"c\", job=\"db\"}".to_owned(), 100.0)]
    );

    let results = engine
      .evaluate(
        "http_requests_total{job=\"db\"} - ignoring(job) http_requests_total{instance=\"c\"}",
        150_000,
      )
      .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get_value(), 0.0);
  }

  #[test]
  fn test_scalar_result() {
    let queryable = http_requests();
    let engine = new_engine(&queryable);

    let results = engine.evaluate("1 + 2 * 3", 0).unwrap();
    assert_eq!(results, vec![RawResult::new(Labels::new(), 7.0)]);

    let results = engine.evaluate("time()", 30_000).unwrap();
    assert_eq!(results[0].get_value(), 30.0);

    let results = engine
      .evaluate("scalar(sum(http_requests_total))", 15_000)
      .unwrap();
    assert_eq!(results[0].get_value(), 15.0 + 15.0 + 150.0);
  }

  #[test]
  fn test_functions() {
    let queryable = http_requests();
    let engine = new_engine(&queryable);

    let results = engine
      .evaluate("clamp_max(http_requests_total{job=\"db\"}, 100)", 150_000)
      .unwrap();
    assert_eq!(results[0].get_value(), 100.0);
    assert_eq!(results[0].get_labels().get_metric_name(), None);

    let results = engine
      .evaluate("timestamp(http_requests_total{job=\"db\"})", 160_000)
      .unwrap();
    assert_eq!(results[0].get_value(), 150.0);

    let results = engine
      .evaluate(
        "last_over_time(http_requests_total{job=\"db\"}[1m])",
        160_000,
      )
      .unwrap();
    assert_eq!(
      results[0].get_labels().get_metric_name(),
      Some("http_requests_total")
    );
    assert_eq!(results[0].get_value(), 1500.0);

    let results = engine.evaluate("vector(3)", 0).unwrap();
    assert_eq!(results, vec![RawResult::new(Labels::new(), 3.0)]);
  }

  #[test]
  fn test_recording_rule_functions() {
    let mut queryable = MemoryQueryable::new();
    for (le, count) in [("0.1", 50.0), ("0.5", 90.0), ("+Inf", 100.0)] {
      queryable.add(
        &[("__name__", "latency_bucket"), ("job", "api"), ("le", le)],
        &[(0, count)],
      );
    }
    queryable.add(
      &[("__name__", "job_owner"), ("job", "api"), ("team", "web")],
      &[(0, 1.0)],
    );
    queryable.add(
      &[("__name__", "temperature"), ("instance", "host-1:9090")],
      &[(0, 10.0), (15_000, 12.0), (30_000, 9.0), (45_000, 15.0)],
    );
    let engine = new_engine(&queryable);

    let results = engine
      .evaluate("histogram_quantile(0.7, sum by (le) (latency_bucket))", 45_000)
      .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].get_labels().is_empty());
    assert!((results[0].get_value() - 0.3).abs() < 1e-12);

    let results = engine
      .evaluate(
        "label_replace(temperature, \"host\", \"$1\", \"instance\", \"(.*):.*\")",
        45_000,
      )
      .unwrap();
    assert_eq!(results[0].get_labels().get("host"), Some("host-1"));
    assert_eq!(
      results[0].get_labels().get_metric_name(),
      Some("temperature")
    );

    let results = engine
      .evaluate("label_join(job_owner, \"id\", \"-\", \"job\", \"team\")", 45_000)
      .unwrap();
    assert_eq!(results[0].get_labels().get("id"), Some("api-web"));

    let results = engine
      .evaluate("absent(nonexistent{job=\"api\", env=~\"p.*\"})", 45_000)
      .unwrap();
    assert_eq!(
      results,
      vec![RawResult::new(vec![("job", "api")].into_iter().collect(), 1.0)]
    );
    assert!(engine.evaluate("absent(job_owner)", 45_000).unwrap().is_empty());

    let value = |query: &str| engine.evaluate(query, 45_000).unwrap()[0].get_value();
    assert_eq!(value("changes(temperature[1m])"), 3.0);
    assert_eq!(value("resets(temperature[1m])"), 1.0);
    assert!((value("deriv(temperature[1m])") - 0.08).abs() < 1e-12);

    let results = engine
      .evaluate("latency_bucket * on(job) group_left(team) job_owner", 45_000)
      .unwrap();
    assert_eq!(results.len(), 3);
    for result in &results {
      assert_eq!(result.get_labels().get("team"), Some("web"));
      assert_eq!(result.get_labels().get_metric_name(), None);
    }
    let mut values: Vec<f64> = results.iter().map(|r| r.get_value()).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    assert_eq!(values, vec![50.0, 90.0, 100.0]);
  }

  #[test]
  fn test_concurrent_queries_share_parse_cache() {
    let queryable = http_requests();
    let metrics = Arc::new(BackfillMetrics::new());
    let engine = PromQLEngine::new(&queryable, 50_000_000, 120_000, 300_000, metrics.clone());

    thread::scope(|scope| {
      for _ in 0..4 {
        scope.spawn(|| {
          for time in (15_000..=150_000).step_by(15_000) {
            let results = engine.evaluate("sum(http_requests_total)", time).unwrap();
            assert_eq!(results.len(), 1);
          }
        });
      }
    });

    assert_eq!(engine.parsed.lock().len(), 1);
    assert_eq!(metrics.get_queries(), 40);
  }

  #[test]
  fn test_errors() {
    let queryable = http_requests();
    let engine = new_engine(&queryable);

    assert!(matches!(
      engine.evaluate("http_requests_total[5m]", 300_000),
      Err(QueryError::BadExpression(_))
    ));
    assert!(matches!(
      engine.evaluate("sum(", 300_000),
      Err(QueryError::BadExpression(_))
    ));

    // Dropping the metric name leaves two series with the same labels.
    let mut queryable = MemoryQueryable::new();
    queryable.add(&[("__name__", "a"), ("job", "x")], &[(0, 1.0)]);
    queryable.add(&[("__name__", "b"), ("job", "x")], &[(0, 1.0)]);
    let engine = new_engine(&queryable);
    assert!(matches!(
      engine.evaluate("abs({job=\"x\"})", 0),
      Err(QueryError::Internal(_))
    ));
  }

  #[test]
  fn test_too_many_samples() {
    let queryable = http_requests();
    let metrics = Arc::new(BackfillMetrics::new());
    let engine = PromQLEngine::new(&queryable, 2, 120_000, 300_000, metrics.clone());

    assert_eq!(
      engine.evaluate("http_requests_total", 300_000),
      Err(QueryError::TooManySamples(2))
    );
    // The budget counts every point of a range selector.
    assert_eq!(
      engine.evaluate("rate(http_requests_total{job=\"db\"}[1m])", 300_000),
      Err(QueryError::TooManySamples(2))
    );
    assert!(engine
      .evaluate("http_requests_total{job=\"db\"}", 300_000)
      .is_ok());

    assert_eq!(metrics.get_queries(), 3);
    assert_eq!(metrics.get_query_failures(), 2);
  }

  #[test]
  fn test_timeout() {
    let mut queryable = http_requests();
    queryable.delay = Some(Duration::from_millis(20));
    let engine = PromQLEngine::new(
      &queryable,
      50_000_000,
      1,
      300_000,
      Arc::new(BackfillMetrics::new()),
    );

    assert!(matches!(
      engine.evaluate("http_requests_total + http_requests_total", 300_000),
      Err(QueryError::Timeout(_))
    ));
  }

  #[test]
  fn test_query_log() {
    let dir = TempDir::new("engine_test").unwrap();
    let path = get_joined_path(dir.path().to_str().unwrap(), "queries.log");

    let queryable = http_requests();
    {
      let engine = new_engine(&queryable).with_query_log(&path).unwrap();
      engine.evaluate("http_requests_total", 300_000).unwrap();
      engine.evaluate("bad(", 300_000).unwrap_err();
    }

    let contents = fs::read_to_string(&path).unwrap();
    let entries: Vec<QueryLogEntry> = contents
      .lines()
      .map(|line| serde_json::from_str(line).unwrap())
      .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].query, "http_requests_total");
    assert_eq!(entries[0].time, 300_000);
    assert!(entries[0].error.is_none());
    assert!(entries[1].error.is_some());
  }

  #[test]
  fn test_closure_is_query_func() {
    fn run<F: QueryFunc>(f: &F) -> Result<Vec<RawResult>, QueryError> {
      f.evaluate("up", 42)
    }

    let f = |expr: &str, time: i64| -> Result<Vec<RawResult>, QueryError> {
      assert_eq!(expr, "up");
      Ok(vec![RawResult::new(Labels::new(), time as f64)])
    };
    assert_eq!(run(&f).unwrap()[0].get_value(), 42.0);
  }
}
