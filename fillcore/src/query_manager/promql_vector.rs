// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::metric::labels::Labels;
use crate::metric::sample::Sample;
use crate::query_manager::ast::{
  AggregationOperator, BinaryOperator, Grouping, MatchCardinality, VectorMatching,
};
use crate::utils::error::QueryError;

/// The label holding the upper bound of a histogram bucket.
const BUCKET_LABEL: &str = "le";

/// An instant vector: at most one sample per series, all evaluated at the same instant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromQLVector {
  vector: Vec<Sample>,
}

impl PromQLVector {
  pub fn new(vector: Vec<Sample>) -> Self {
    PromQLVector { vector }
  }

  pub fn get_vector(&self) -> &Vec<Sample> {
    &self.vector
  }

  pub fn into_vector(self) -> Vec<Sample> {
    self.vector
  }

  pub fn len(&self) -> usize {
    self.vector.len()
  }

  pub fn is_empty(&self) -> bool {
    self.vector.is_empty()
  }

  /// Set the time of every sample, normally to the evaluation instant.
  pub fn set_time(&mut self, time: i64) {
    for sample in &mut self.vector {
      sample.set_time(time);
    }
  }

  /// Fail if two samples ended up with the same labels, for example after a function dropped
  /// the metric name of two series that differed only by name.
  pub fn check_unique_labels(&self) -> Result<(), QueryError> {
    let mut seen = HashSet::new();
    for sample in &self.vector {
      if !seen.insert(sample.get_labels()) {
        return Err(QueryError::Internal(format!(
          "vector cannot contain metrics with the same labelset {}",
          sample.get_labels()
        )));
      }
    }
    Ok(())
  }

  // ******** Functions: https://prometheus.io/docs/prometheus/latest/querying/functions/

  /// Apply a function to every value. The result no longer carries a metric name.
  pub fn apply_function<F: Fn(f64) -> f64>(&mut self, f: F) {
    for sample in &mut self.vector {
      sample.set_value(f(sample.get_value()));
      sample.get_labels_mut().remove_metric_name();
    }
  }

  pub fn negate(&mut self) {
    self.apply_function(|v| -v);
  }

  /// Replace every value with the sample's timestamp, in seconds.
  pub fn timestamp(&mut self) {
    for sample in &mut self.vector {
      sample.set_value(sample.get_time() as f64 / 1000.0);
      sample.get_labels_mut().remove_metric_name();
    }
  }

  /// Round to the nearest multiple of `to_nearest`, rounding halves up.
  pub fn round(&mut self, to_nearest: f64) {
    let to_nearest_inverse = 1.0 / to_nearest;
    self.apply_function(|v| (v * to_nearest_inverse + 0.5).floor() / to_nearest_inverse);
  }

  /// For every sample whose `src` label matches `regex`, set `dst` to `replacement` with the
  /// capture groups expanded (`$1`, `${name}`). Samples that do not match are left alone.
  pub fn label_replace(
    &mut self,
    dst: &str,
    replacement: &str,
    src: &str,
    regex: &str,
  ) -> Result<(), QueryError> {
    let regex = Regex::new(&format!("^(?:{})$", regex))
      .map_err(|e| QueryError::BadExpression(format!("invalid regular expression: {}", e)))?;

    for sample in &mut self.vector {
      let src_value = sample.get_labels().get(src).unwrap_or("").to_owned();
      if let Some(captures) = regex.captures(&src_value) {
        let mut value = String::new();
        captures.expand(replacement, &mut value);
        sample.get_labels_mut().set(dst, &value);
      }
    }
    Ok(())
  }

  /// Set `dst` to the values of the `src` labels joined by `separator`.
  pub fn label_join(&mut self, dst: &str, separator: &str, src: &[&str]) {
    for sample in &mut self.vector {
      let value = src
        .iter()
        .map(|name| sample.get_labels().get(name).unwrap_or(""))
        .collect::<Vec<&str>>()
        .join(separator);
      sample.get_labels_mut().set(dst, &value);
    }
  }

  /// The phi-quantile of every histogram in the vector. Samples are grouped into histograms by
  /// their labels other than the metric name and `le`, and samples without a valid `le` are
  /// ignored.
  pub fn histogram_quantile(&self, phi: f64, time: i64) -> PromQLVector {
    let mut histograms: Vec<(Labels, Vec<(f64, f64)>)> = Vec::new();
    let mut histogram_index: HashMap<Labels, usize> = HashMap::new();

    for sample in &self.vector {
      let upper_bound = match sample.get_labels().get(BUCKET_LABEL).and_then(parse_bucket_bound) {
        Some(upper_bound) => upper_bound,
        None => continue,
      };
      let mut key = sample.get_labels().clone();
      key.remove(BUCKET_LABEL);
      key.remove_metric_name();

      let bucket = (upper_bound, sample.get_value());
      match histogram_index.get(&key) {
        Some(&index) => histograms[index].1.push(bucket),
        None => {
          histogram_index.insert(key.clone(), histograms.len());
          histograms.push((key, vec![bucket]));
        }
      }
    }

    PromQLVector::new(
      histograms
        .into_iter()
        .map(|(labels, mut buckets)| Sample::new(labels, time, bucket_quantile(phi, &mut buckets)))
        .collect(),
    )
  }

  // ******** Aggregations: https://prometheus.io/docs/prometheus/latest/querying/operators/

  /// Aggregate the samples of each group into one sample. Groups appear in the order their
  /// first sample appears. `topk` and `bottomk` keep the selected samples with all their labels.
  pub fn aggregate(
    &self,
    op: AggregationOperator,
    param: Option<f64>,
    grouping: Option<&Grouping>,
    time: i64,
  ) -> PromQLVector {
    let mut groups: Vec<(Labels, Vec<&Sample>)> = Vec::new();
    let mut group_index: HashMap<Labels, usize> = HashMap::new();

    for sample in &self.vector {
      let key = grouping_labels(sample.get_labels(), grouping);
      match group_index.get(&key) {
        Some(&index) => groups[index].1.push(sample),
        None => {
          group_index.insert(key.clone(), groups.len());
          groups.push((key, vec![sample]));
        }
      }
    }

    let param = param.unwrap_or(f64::NAN);
    let mut result = Vec::new();
    for (labels, mut samples) in groups {
      match op {
        AggregationOperator::Topk | AggregationOperator::Bottomk => {
          if param.is_nan() || param < 1.0 {
            continue;
          }
          let k = (param as usize).min(samples.len());
          if op == AggregationOperator::Topk {
            samples.sort_by(|a, b| compare_desc(a.get_value(), b.get_value()));
          } else {
            samples.sort_by(|a, b| compare_asc(a.get_value(), b.get_value()));
          }
          for sample in samples.into_iter().take(k) {
            result.push(Sample::new(sample.get_labels().clone(), time, sample.get_value()));
          }
        }
        _ => {
          let mut values: Vec<f64> = samples.iter().map(|s| s.get_value()).collect();
          let value = aggregate_values(op, param, &mut values);
          result.push(Sample::new(labels, time, value));
        }
      }
    }

    PromQLVector::new(result)
  }

  // ******** Binary Operators: https://prometheus.io/docs/prometheus/latest/querying/operators/

  /// Apply an operator between every sample and a scalar. Comparisons without `bool` filter the
  /// vector and always keep the sample's own value, even when the scalar is on the left.
  pub fn binary_with_scalar(
    &self,
    op: BinaryOperator,
    scalar: f64,
    scalar_on_left: bool,
    return_bool: bool,
  ) -> PromQLVector {
    let mut result = Vec::new();
    for sample in &self.vector {
      let (lhs, rhs) = if scalar_on_left {
        (scalar, sample.get_value())
      } else {
        (sample.get_value(), scalar)
      };

      let (mut value, keep) = binary_value(op, lhs, rhs);
      if op.is_comparison() && scalar_on_left {
        value = sample.get_value();
      }
      if return_bool {
        value = if keep { 1.0 } else { 0.0 };
      } else if !keep {
        continue;
      }

      let mut out = sample.clone();
      if drops_metric_name(op, return_bool) {
        out.get_labels_mut().remove_metric_name();
      }
      out.set_value(value);
      result.push(out);
    }
    PromQLVector::new(result)
  }

  /// Apply an arithmetic or comparison operator between two vectors. Matching is one-to-one
  /// unless `group_left` or `group_right` allows several series on one side per match.
  pub fn binary_with_vector(
    &self,
    op: BinaryOperator,
    other: &PromQLVector,
    matching: Option<&VectorMatching>,
    return_bool: bool,
  ) -> Result<PromQLVector, QueryError> {
    let card = matching
      .map(|m| m.card)
      .unwrap_or(MatchCardinality::OneToOne);
    let (many, one, one_side) = match card {
      MatchCardinality::OneToMany => (other, self, "left"),
      _ => (self, other, "right"),
    };

    let mut one_by_signature: HashMap<Labels, &Sample> = HashMap::new();
    for sample in &one.vector {
      let signature = matching_signature(sample.get_labels(), matching);
      if one_by_signature.insert(signature.clone(), sample).is_some() {
        return Err(QueryError::Internal(format!(
          concat!(
            "found duplicate series for the match group {} on the {} hand-side of the operation; ",
            "many-to-many matching not allowed"
          ),
          signature, one_side
        )));
      }
    }

    // Result labels already produced for every match group.
    let mut matched: HashMap<Labels, HashSet<Labels>> = HashMap::new();
    let mut result = Vec::new();
    for sample in &many.vector {
      let signature = matching_signature(sample.get_labels(), matching);
      let one_sample = match one_by_signature.get(&signature) {
        Some(one_sample) => one_sample,
        None => continue,
      };

      let (lhs, rhs) = match card {
        MatchCardinality::OneToMany => (one_sample.get_value(), sample.get_value()),
        _ => (sample.get_value(), one_sample.get_value()),
      };
      let (mut value, keep) = binary_value(op, lhs, rhs);
      if return_bool {
        value = if keep { 1.0 } else { 0.0 };
      } else if !keep {
        continue;
      }

      let labels = result_labels(
        sample.get_labels(),
        one_sample.get_labels(),
        op,
        matching,
        return_bool,
      );
      let produced = matched.entry(signature.clone()).or_default();
      if card == MatchCardinality::OneToOne && !produced.is_empty() {
        return Err(QueryError::Internal(format!(
          concat!(
            "multiple matches for labels {}: many-to-one matching must be explicit ",
            "(group_left/group_right)"
          ),
          signature
        )));
      }
      if !produced.insert(labels.clone()) {
        return Err(QueryError::Internal(format!(
          "multiple matches for labels {}: grouping labels must ensure unique matches",
          signature
        )));
      }
      result.push(Sample::new(labels, sample.get_time(), value));
    }

    Ok(PromQLVector::new(result))
  }

  /// Samples of this vector that have a match in the other vector.
  pub fn and(&self, other: &PromQLVector, matching: Option<&VectorMatching>) -> PromQLVector {
    let signatures = other.signatures(matching);
    PromQLVector::new(
      self
        .vector
        .iter()
        .filter(|s| signatures.contains(&matching_signature(s.get_labels(), matching)))
        .cloned()
        .collect(),
    )
  }

  /// All samples of this vector, plus the samples of the other vector without a match here.
  pub fn or(&self, other: &PromQLVector, matching: Option<&VectorMatching>) -> PromQLVector {
    let signatures = self.signatures(matching);
    let mut result = self.vector.clone();
    result.extend(
      other
        .vector
        .iter()
        .filter(|s| !signatures.contains(&matching_signature(s.get_labels(), matching)))
        .cloned(),
    );
    PromQLVector::new(result)
  }

  /// Samples of this vector that have no match in the other vector.
  pub fn unless(&self, other: &PromQLVector, matching: Option<&VectorMatching>) -> PromQLVector {
    let signatures = other.signatures(matching);
    PromQLVector::new(
      self
        .vector
        .iter()
        .filter(|s| !signatures.contains(&matching_signature(s.get_labels(), matching)))
        .cloned()
        .collect(),
    )
  }

  fn signatures(&self, matching: Option<&VectorMatching>) -> HashSet<Labels> {
    self
      .vector
      .iter()
      .map(|s| matching_signature(s.get_labels(), matching))
      .collect()
  }
}

/// Compute the value of a binary operator and whether the result is kept. Comparisons keep
/// the left hand side value when they hold. Set operators are applied to whole vectors, never
/// to single values.
pub fn binary_value(op: BinaryOperator, lhs: f64, rhs: f64) -> (f64, bool) {
  match op {
    BinaryOperator::Plus => (lhs + rhs, true),
    BinaryOperator::Minus => (lhs - rhs, true),
    BinaryOperator::Multiply => (lhs * rhs, true),
    BinaryOperator::Divide => (lhs / rhs, true),
    BinaryOperator::Modulo => (lhs % rhs, true),
    BinaryOperator::Power => (lhs.powf(rhs), true),
    BinaryOperator::Equal => (lhs, lhs == rhs),
    BinaryOperator::NotEqual => (lhs, lhs != rhs),
    BinaryOperator::GreaterThan => (lhs, lhs > rhs),
    BinaryOperator::LessThan => (lhs, lhs < rhs),
    BinaryOperator::GreaterThanOrEqual => (lhs, lhs >= rhs),
    BinaryOperator::LessThanOrEqual => (lhs, lhs <= rhs),
    BinaryOperator::Or | BinaryOperator::And | BinaryOperator::Unless => (lhs, true),
  }
}

fn drops_metric_name(op: BinaryOperator, return_bool: bool) -> bool {
  return_bool || !(op.is_comparison() || op.is_set_operator())
}

/// Labels of a binary operation result, built from the sample on the "many" side. One-to-one
/// results are narrowed to the matching labels. `group_left`/`group_right` results copy the
/// included labels from the "one" side instead.
fn result_labels(
  many: &Labels,
  one: &Labels,
  op: BinaryOperator,
  matching: Option<&VectorMatching>,
  return_bool: bool,
) -> Labels {
  let mut labels = many.clone();
  if drops_metric_name(op, return_bool) {
    labels.remove_metric_name();
  }
  if let Some(matching) = matching {
    if matching.card == MatchCardinality::OneToOne {
      if matching.on {
        labels.keep(&matching.labels);
      } else {
        labels.drop_names(&matching.labels);
      }
    }
    for name in &matching.include {
      labels.set(name, one.get(name).unwrap_or(""));
    }
  }
  labels
}

/// Parse the upper bound of a bucket, accepting `+Inf`.
fn parse_bucket_bound(value: &str) -> Option<f64> {
  let value = value.trim();
  if value.eq_ignore_ascii_case("+inf") || value.eq_ignore_ascii_case("inf") {
    return Some(f64::INFINITY);
  }
  value.parse::<f64>().ok()
}

/// Estimate the phi-quantile of a histogram from its cumulative `(upper bound, count)` buckets,
/// interpolating linearly inside the bucket the quantile falls in. The highest bucket must be
/// `+Inf`. A quantile in the `+Inf` bucket is reported as the upper bound of the bucket below.
fn bucket_quantile(phi: f64, buckets: &mut Vec<(f64, f64)>) -> f64 {
  if phi.is_nan() {
    return f64::NAN;
  }
  if phi < 0.0 {
    return f64::NEG_INFINITY;
  }
  if phi > 1.0 {
    return f64::INFINITY;
  }

  buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
  match buckets.last() {
    Some((upper_bound, _)) if *upper_bound == f64::INFINITY => {}
    _ => return f64::NAN,
  }

  // Merge buckets with the same bound, then force the counts to be non-decreasing.
  buckets.dedup_by(|next, kept| {
    if next.0 == kept.0 {
      kept.1 += next.1;
      true
    } else {
      false
    }
  });
  let mut max = f64::NEG_INFINITY;
  for bucket in buckets.iter_mut() {
    max = max.max(bucket.1);
    bucket.1 = max;
  }

  if buckets.len() < 2 {
    return f64::NAN;
  }
  let observations = buckets[buckets.len() - 1].1;
  if observations == 0.0 {
    return f64::NAN;
  }

  let mut rank = phi * observations;
  let index = buckets.partition_point(|bucket| bucket.1 < rank);
  if index >= buckets.len() - 1 {
    return buckets[buckets.len() - 2].0;
  }
  if index == 0 && buckets[0].0 <= 0.0 {
    return buckets[0].0;
  }

  let mut bucket_start = 0.0;
  let bucket_end = buckets[index].0;
  let mut count = buckets[index].1;
  if index > 0 {
    bucket_start = buckets[index - 1].0;
    count -= buckets[index - 1].1;
    rank -= buckets[index - 1].1;
  }
  bucket_start + (bucket_end - bucket_start) * (rank / count)
}

/// The labels used to group a sample in an aggregation.
fn grouping_labels(labels: &Labels, grouping: Option<&Grouping>) -> Labels {
  match grouping {
    None => Labels::new(),
    Some(grouping) => {
      let mut key = labels.clone();
      if grouping.without {
        key.remove_metric_name();
        key.drop_names(&grouping.labels);
      } else {
        key.keep(&grouping.labels);
      }
      key
    }
  }
}

/// The labels used to match samples of two vectors in a binary operation.
fn matching_signature(labels: &Labels, matching: Option<&VectorMatching>) -> Labels {
  let mut signature = labels.clone();
  match matching {
    Some(matching) if matching.on => signature.keep(&matching.labels),
    Some(matching) => {
      signature.remove_metric_name();
      signature.drop_names(&matching.labels);
    }
    None => signature.remove_metric_name(),
  }
  signature
}

// NaN sorts last in both directions.
fn compare_desc(a: f64, b: f64) -> Ordering {
  match (a.is_nan(), b.is_nan()) {
    (true, true) => Ordering::Equal,
    (true, false) => Ordering::Greater,
    (false, true) => Ordering::Less,
    (false, false) => b.total_cmp(&a),
  }
}

fn compare_asc(a: f64, b: f64) -> Ordering {
  match (a.is_nan(), b.is_nan()) {
    (true, true) => Ordering::Equal,
    (true, false) => Ordering::Greater,
    (false, true) => Ordering::Less,
    (false, false) => a.total_cmp(&b),
  }
}

fn aggregate_values(op: AggregationOperator, param: f64, values: &mut [f64]) -> f64 {
  let count = values.len() as f64;
  match op {
    AggregationOperator::Sum => values.iter().sum(),
    AggregationOperator::Avg => values.iter().sum::<f64>() / count,
    AggregationOperator::Min => values
      .iter()
      .copied()
      .fold(f64::NAN, |min, v| if v < min || min.is_nan() { v } else { min }),
    AggregationOperator::Max => values
      .iter()
      .copied()
      .fold(f64::NAN, |max, v| if v > max || max.is_nan() { v } else { max }),
    AggregationOperator::Count => count,
    AggregationOperator::Group => 1.0,
    AggregationOperator::Stdvar => variance(values),
    AggregationOperator::Stddev => variance(values).sqrt(),
    AggregationOperator::Quantile => quantile(param, values),
    // Handled per sample by the caller.
    AggregationOperator::Topk | AggregationOperator::Bottomk => f64::NAN,
  }
}

fn variance(values: &[f64]) -> f64 {
  let count = values.len() as f64;
  let mean = values.iter().sum::<f64>() / count;
  values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count
}

/// The phi-quantile of the values, interpolating linearly between the two nearest ranks.
fn quantile(phi: f64, values: &mut [f64]) -> f64 {
  if values.is_empty() || phi.is_nan() {
    return f64::NAN;
  }
  if phi < 0.0 {
    return f64::NEG_INFINITY;
  }
  if phi > 1.0 {
    return f64::INFINITY;
  }

  values.sort_by(|a, b| a.total_cmp(b));
  let rank = phi * (values.len() - 1) as f64;
  let lower = rank.floor() as usize;
  let upper = (lower + 1).min(values.len() - 1);
  let weight = rank - rank.floor();

  values[lower] * (1.0 - weight) + values[upper] * weight
}
