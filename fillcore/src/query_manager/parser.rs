// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Parse a PromQL expression.
//!
//! Uses the Pest parser with Pest-formatted PEG grammars: https://pest.rs/
//! which validates syntax. The resulting pairs are folded into an [Expr] tree, which is then
//! type checked so that malformed rules are rejected before any evaluation starts.

use log::debug;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::metric::constants::{MetricsQueryCondition, METRIC_NAME_LABEL};
use crate::metric::matcher::LabelMatcher;
use crate::query_manager::ast::{
  AggregationOperator, BinaryOperator, Expr, FunctionOperator, Grouping, MatchCardinality,
  ValueType, VectorMatching, VectorSelector,
};
use crate::utils::error::QueryError;
use crate::utils::time::parse_duration;

#[derive(Parser)]
#[grammar = "src/query_manager/promql_grammar.pest"]
pub struct PromQLParser;

/// Parse and type check an expression. Only expressions that evaluate to a scalar or an
/// instant vector are accepted, as those are the only ones that can be recorded.
pub fn parse_expr(query: &str) -> Result<Expr, QueryError> {
  debug!("PROMQL: Parsing query {:?}", query);

  let mut pairs = PromQLParser::parse(Rule::start, query)
    .map_err(|e| QueryError::BadExpression(e.to_string()))?;

  let start = pairs
    .next()
    .ok_or_else(|| QueryError::BadExpression("Empty expression".to_owned()))?;
  let expression = start
    .into_inner()
    .find(|pair| pair.as_rule() == Rule::expression)
    .ok_or_else(|| QueryError::BadExpression("Empty expression".to_owned()))?;

  let expr = build_expr(expression).map_err(QueryError::BadExpression)?;
  expr.check().map_err(QueryError::BadExpression)?;

  if !matches!(expr.value_type(), ValueType::Scalar | ValueType::Vector) {
    return Err(QueryError::BadExpression(
      "expression must evaluate to a scalar or an instant vector".to_owned(),
    ));
  }

  Ok(expr)
}

fn build_expr(pair: Pair<'_, Rule>) -> Result<Expr, String> {
  match pair.as_rule() {
    Rule::expression
    | Rule::and_unless_expression
    | Rule::comparison_expression
    | Rule::additive_expression
    | Rule::multiplicative_expression => build_binary_chain(pair),
    Rule::unary_expression => build_unary(pair),
    Rule::power_expression => build_power(pair),
    Rule::paren_expression => {
      let inner = first_inner(pair)?;
      Ok(Expr::Paren(Box::new(build_expr(inner)?)))
    }
    Rule::aggregation => build_aggregation(pair),
    Rule::function_call => build_function_call(pair),
    Rule::number => Ok(Expr::NumberLiteral(parse_number(pair.as_str())?)),
    Rule::string => Ok(Expr::StringLiteral(string_literal(pair))),
    Rule::vector_selector => build_vector_selector(pair),
    rule => Err(format!("Unexpected token {:?}", rule)),
  }
}

fn first_inner(pair: Pair<'_, Rule>) -> Result<Pair<'_, Rule>, String> {
  let text = pair.as_str().to_owned();
  pair
    .into_inner()
    .next()
    .ok_or_else(|| format!("Incomplete expression {:?}", text))
}

/// Fold `operand (op operand)*` into a left-associative tree.
fn build_binary_chain(pair: Pair<'_, Rule>) -> Result<Expr, String> {
  let mut inner = pair.into_inner();
  let first = inner
    .next()
    .ok_or_else(|| "Missing operand".to_owned())?;
  let mut lhs = build_expr(first)?;

  while let Some(op_pair) = inner.next() {
    let (op, return_bool, matching) = build_binary_operator(op_pair)?;
    let rhs_pair = inner
      .next()
      .ok_or_else(|| format!("Missing right hand side for operator {:?}", op))?;
    let rhs = build_expr(rhs_pair)?;
    lhs = Expr::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
      return_bool,
      matching,
    };
  }

  Ok(lhs)
}

fn build_binary_operator(
  pair: Pair<'_, Rule>,
) -> Result<(BinaryOperator, bool, Option<VectorMatching>), String> {
  let op = match pair.as_rule() {
    Rule::or_op => BinaryOperator::Or,
    Rule::and_op => BinaryOperator::And,
    Rule::unless_op => BinaryOperator::Unless,
    Rule::eq_op => BinaryOperator::Equal,
    Rule::ne_op => BinaryOperator::NotEqual,
    Rule::gt_op => BinaryOperator::GreaterThan,
    Rule::lt_op => BinaryOperator::LessThan,
    Rule::ge_op => BinaryOperator::GreaterThanOrEqual,
    Rule::le_op => BinaryOperator::LessThanOrEqual,
    Rule::add_op => BinaryOperator::Plus,
    Rule::sub_op => BinaryOperator::Minus,
    Rule::mul_op => BinaryOperator::Multiply,
    Rule::div_op => BinaryOperator::Divide,
    Rule::mod_op => BinaryOperator::Modulo,
    Rule::pow_op => BinaryOperator::Power,
    rule => return Err(format!("Unexpected operator {:?}", rule)),
  };

  let mut return_bool = false;
  let mut matching = None;
  for modifier in pair.into_inner() {
    match modifier.as_rule() {
      Rule::bool_kw => return_bool = true,
      Rule::vector_matching => matching = Some(build_vector_matching(modifier)?),
      _ => {}
    }
  }

  Ok((op, return_bool, matching))
}

fn build_vector_matching(pair: Pair<'_, Rule>) -> Result<VectorMatching, String> {
  let mut inner = pair.into_inner();
  let kind = inner
    .next()
    .ok_or_else(|| "Missing on/ignoring".to_owned())?;
  let mut matching = VectorMatching::one_to_one(kind.as_rule() == Rule::on_kw, Vec::new());

  for part in inner {
    match part.as_rule() {
      Rule::label_list => matching.labels = build_label_list(part),
      Rule::group_modifier => {
        let mut group = part.into_inner();
        let side = group
          .next()
          .ok_or_else(|| "Missing group_left/group_right".to_owned())?;
        matching.card = match side.as_rule() {
          Rule::group_left_kw => MatchCardinality::ManyToOne,
          _ => MatchCardinality::OneToMany,
        };
        if let Some(list) = group.next() {
          matching.include = build_label_list(list);
        }
      }
      rule => return Err(format!("Unexpected token {:?} in vector matching", rule)),
    }
  }

  Ok(matching)
}

fn build_unary(pair: Pair<'_, Rule>) -> Result<Expr, String> {
  let mut negate = false;
  let mut operand = None;
  for inner in pair.into_inner() {
    match inner.as_rule() {
      Rule::neg_op => negate = !negate,
      Rule::pos_op => {}
      _ => operand = Some(build_expr(inner)?),
    }
  }

  let operand = operand.ok_or_else(|| "Missing operand for unary operator".to_owned())?;
  if !negate {
    return Ok(operand);
  }

  // Fold negative number literals so that `-1` is a scalar literal.
  match operand {
    Expr::NumberLiteral(value) => Ok(Expr::NumberLiteral(-value)),
    other => Ok(Expr::Negation(Box::new(other))),
  }
}

fn build_power(pair: Pair<'_, Rule>) -> Result<Expr, String> {
  let mut inner = pair.into_inner();
  let base = build_expr(inner.next().ok_or_else(|| "Missing operand".to_owned())?)?;

  match inner.next() {
    Some(op_pair) => {
      let (op, return_bool, matching) = build_binary_operator(op_pair)?;
      let exponent_pair = inner
        .next()
        .ok_or_else(|| "Missing exponent".to_owned())?;
      Ok(Expr::Binary {
        op,
        lhs: Box::new(base),
        rhs: Box::new(build_expr(exponent_pair)?),
        return_bool,
        matching,
      })
    }
    None => Ok(base),
  }
}

fn build_aggregation(pair: Pair<'_, Rule>) -> Result<Expr, String> {
  let mut op = None;
  let mut grouping = None;
  let mut args = Vec::new();

  for inner in pair.into_inner() {
    match inner.as_rule() {
      Rule::aggregate_op => {
        op = AggregationOperator::from_name(inner.as_str());
      }
      Rule::grouping => {
        if grouping.is_some() {
          return Err("aggregation may only have one by/without clause".to_owned());
        }
        grouping = Some(build_grouping(inner)?);
      }
      _ => args.push(build_expr(inner)?),
    }
  }

  let op = op.ok_or_else(|| "Unknown aggregation".to_owned())?;
  let (param, expr) = match args.len() {
    1 => (None, args.remove(0)),
    2 => {
      let expr = args.remove(1);
      (Some(Box::new(args.remove(0))), expr)
    }
    n => return Err(format!("wrong number of arguments for aggregation {:?}: {}", op, n)),
  };

  Ok(Expr::Aggregation {
    op,
    param,
    expr: Box::new(expr),
    grouping,
  })
}

fn build_grouping(pair: Pair<'_, Rule>) -> Result<Grouping, String> {
  let mut inner = pair.into_inner();
  let kind = inner
    .next()
    .ok_or_else(|| "Missing by/without".to_owned())?;
  let labels = match inner.next() {
    Some(list) => build_label_list(list),
    None => Vec::new(),
  };

  Ok(Grouping {
    without: kind.as_rule() == Rule::without_kw,
    labels,
  })
}

fn build_label_list(pair: Pair<'_, Rule>) -> Vec<String> {
  pair
    .into_inner()
    .map(|label| label.as_str().to_owned())
    .collect()
}

fn build_function_call(pair: Pair<'_, Rule>) -> Result<Expr, String> {
  let mut inner = pair.into_inner();
  let name_pair = inner
    .next()
    .ok_or_else(|| "Missing function name".to_owned())?;
  let func = FunctionOperator::from_name(name_pair.as_str())
    .ok_or_else(|| format!("unknown function with name {:?}", name_pair.as_str()))?;

  let args = inner.map(build_expr).collect::<Result<Vec<Expr>, String>>()?;

  Ok(Expr::FunctionCall { func, args })
}

fn build_vector_selector(pair: Pair<'_, Rule>) -> Result<Expr, String> {
  let mut matchers = Vec::new();
  let mut range = None;
  let mut offset = 0;
  let mut has_metric_name = false;

  for inner in pair.into_inner() {
    match inner.as_rule() {
      Rule::metric_name => {
        has_metric_name = true;
        matchers.push(LabelMatcher::new(
          METRIC_NAME_LABEL,
          inner.as_str(),
          MetricsQueryCondition::Equals,
        )?);
      }
      Rule::label_matchers => {
        for matcher_pair in inner.into_inner() {
          let matcher = build_label_matcher(matcher_pair)?;
          if has_metric_name && matcher.get_label_name() == METRIC_NAME_LABEL {
            return Err("metric name must not be set twice".to_owned());
          }
          matchers.push(matcher);
        }
      }
      Rule::matrix_range => {
        let duration = first_inner(inner)?;
        range = Some(parse_duration(duration.as_str())?);
      }
      Rule::offset => {
        let duration = inner
          .into_inner()
          .find(|p| p.as_rule() == Rule::duration)
          .ok_or_else(|| "Missing offset duration".to_owned())?;
        offset = parse_duration(duration.as_str())?;
      }
      rule => return Err(format!("Unexpected token {:?} in selector", rule)),
    }
  }

  let selector = VectorSelector { matchers, offset };
  match range {
    Some(range) => Ok(Expr::MatrixSelector { selector, range }),
    None => Ok(Expr::VectorSelector(selector)),
  }
}

fn build_label_matcher(pair: Pair<'_, Rule>) -> Result<LabelMatcher, String> {
  let mut inner = pair.into_inner();
  let name = inner
    .next()
    .ok_or_else(|| "Missing label name".to_owned())?;
  let op = inner
    .next()
    .ok_or_else(|| "Missing match operator".to_owned())?;
  let value = inner
    .next()
    .ok_or_else(|| "Missing label value".to_owned())?;

  let condition = match op.as_str() {
    "=" => MetricsQueryCondition::Equals,
    "!=" => MetricsQueryCondition::NotEquals,
    "=~" => MetricsQueryCondition::EqualsRegex,
    "!~" => MetricsQueryCondition::NotEqualsRegex,
    other => return Err(format!("Unknown match operator {:?}", other)),
  };

  LabelMatcher::new(name.as_str(), &string_literal(value), condition)
}

/// The unescaped contents of a quoted string.
fn string_literal(pair: Pair<'_, Rule>) -> String {
  let raw = pair
    .into_inner()
    .next()
    .map(|p| p.as_str())
    .unwrap_or("");
  unescape(raw)
}

fn unescape(raw: &str) -> String {
  let mut result = String::with_capacity(raw.len());
  let mut chars = raw.chars();
  while let Some(c) = chars.next() {
    if c != '\\' {
      result.push(c);
      continue;
    }
    match chars.next() {
      Some('n') => result.push('\n'),
      Some('t') => result.push('\t'),
      Some('r') => result.push('\r'),
      Some(other) => result.push(other),
      None => result.push('\\'),
    }
  }
  result
}

fn parse_number(s: &str) -> Result<f64, String> {
  let lower = s.to_ascii_lowercase();
  if let Some(hex) = lower.strip_prefix("0x") {
    return i64::from_str_radix(hex, 16)
      .map(|v| v as f64)
      .map_err(|e| format!("Invalid number {:?}: {}", s, e));
  }
  match lower.as_str() {
    "inf" => Ok(f64::INFINITY),
    "nan" => Ok(f64::NAN),
    _ => lower
      .parse::<f64>()
      .map_err(|e| format!("Invalid number {:?}: {}", s, e)),
  }
}
