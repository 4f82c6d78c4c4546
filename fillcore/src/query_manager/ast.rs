// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Abstract syntax tree for the supported PromQL subset, with the static type rules used to
//! reject expressions before they are ever evaluated.

use regex::Regex;

use crate::metric::labels::is_valid_label_name;
use crate::metric::matcher::LabelMatcher;

/// The type an expression evaluates to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
  Scalar,
  Vector,
  Matrix,
  String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregationOperator {
  Sum,
  Avg,
  Min,
  Max,
  Count,
  Group,
  Stddev,
  Stdvar,
  Topk,
  Bottomk,
  Quantile,
}

impl AggregationOperator {
  pub fn from_name(name: &str) -> Option<Self> {
    let op = match name {
      "sum" => AggregationOperator::Sum,
      "avg" => AggregationOperator::Avg,
      "min" => AggregationOperator::Min,
      "max" => AggregationOperator::Max,
      "count" => AggregationOperator::Count,
      "group" => AggregationOperator::Group,
      "stddev" => AggregationOperator::Stddev,
      "stdvar" => AggregationOperator::Stdvar,
      "topk" => AggregationOperator::Topk,
      "bottomk" => AggregationOperator::Bottomk,
      "quantile" => AggregationOperator::Quantile,
      _ => return None,
    };
    Some(op)
  }

  /// Whether the operator takes a scalar parameter before the aggregated expression.
  pub fn takes_parameter(&self) -> bool {
    matches!(
      self,
      AggregationOperator::Topk | AggregationOperator::Bottomk | AggregationOperator::Quantile
    )
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionOperator {
  // Range vector functions.
  Rate,
  Irate,
  Increase,
  Delta,
  AvgOverTime,
  SumOverTime,
  MinOverTime,
  MaxOverTime,
  CountOverTime,
  LastOverTime,
  StddevOverTime,
  StdvarOverTime,
  Changes,
  Resets,
  Deriv,

  // Instant vector functions.
  Abs,
  Ceil,
  Floor,
  Round,
  Sqrt,
  Exp,
  Ln,
  Log2,
  Log10,
  ClampMin,
  ClampMax,
  HistogramQuantile,
  LabelReplace,
  LabelJoin,
  Absent,

  // Conversions.
  Time,
  Vector,
  Scalar,
  Timestamp,
}

impl FunctionOperator {
  pub fn from_name(name: &str) -> Option<Self> {
    let func = match name {
      "rate" => FunctionOperator::Rate,
      "irate" => FunctionOperator::Irate,
      "increase" => FunctionOperator::Increase,
      "delta" => FunctionOperator::Delta,
      "avg_over_time" => FunctionOperator::AvgOverTime,
      "sum_over_time" => FunctionOperator::SumOverTime,
      "min_over_time" => FunctionOperator::MinOverTime,
      "max_over_time" => FunctionOperator::MaxOverTime,
      "count_over_time" => FunctionOperator::CountOverTime,
      "last_over_time" => FunctionOperator::LastOverTime,
      "stddev_over_time" => FunctionOperator::StddevOverTime,
      "stdvar_over_time" => FunctionOperator::StdvarOverTime,
      "changes" => FunctionOperator::Changes,
      "resets" => FunctionOperator::Resets,
      "deriv" => FunctionOperator::Deriv,
      "abs" => FunctionOperator::Abs,
      "ceil" => FunctionOperator::Ceil,
      "floor" => FunctionOperator::Floor,
      "round" => FunctionOperator::Round,
      "sqrt" => FunctionOperator::Sqrt,
      "exp" => FunctionOperator::Exp,
      "ln" => FunctionOperator::Ln,
      "log2" => FunctionOperator::Log2,
      "log10" => FunctionOperator::Log10,
      "clamp_min" => FunctionOperator::ClampMin,
      "clamp_max" => FunctionOperator::ClampMax,
      "histogram_quantile" => FunctionOperator::HistogramQuantile,
      "label_replace" => FunctionOperator::LabelReplace,
      "label_join" => FunctionOperator::LabelJoin,
      "absent" => FunctionOperator::Absent,
      "time" => FunctionOperator::Time,
      "vector" => FunctionOperator::Vector,
      "scalar" => FunctionOperator::Scalar,
      "timestamp" => FunctionOperator::Timestamp,
      _ => return None,
    };
    Some(func)
  }

  /// Argument types, and how many of the trailing arguments may be omitted.
  pub fn signature(&self) -> (&'static [ValueType], usize) {
    use FunctionOperator::*;
    match self {
      Rate | Irate | Increase | Delta | AvgOverTime | SumOverTime | MinOverTime | MaxOverTime
      | CountOverTime | LastOverTime | StddevOverTime | StdvarOverTime | Changes | Resets
      | Deriv => (&[ValueType::Matrix], 0),
      Abs | Ceil | Floor | Sqrt | Exp | Ln | Log2 | Log10 | Scalar | Timestamp | Absent => {
        (&[ValueType::Vector], 0)
      }
      Round => (&[ValueType::Vector, ValueType::Scalar], 1),
      ClampMin | ClampMax => (&[ValueType::Vector, ValueType::Scalar], 0),
      HistogramQuantile => (&[ValueType::Scalar, ValueType::Vector], 0),
      LabelReplace => (
        &[
          ValueType::Vector,
          ValueType::String,
          ValueType::String,
          ValueType::String,
          ValueType::String,
        ],
        0,
      ),
      LabelJoin => (&[ValueType::Vector, ValueType::String, ValueType::String], 0),
      Time => (&[], 0),
      Vector => (&[ValueType::Scalar], 0),
    }
  }

  /// Whether any number of string arguments may follow the fixed ones.
  pub fn is_variadic(&self) -> bool {
    *self == FunctionOperator::LabelJoin
  }

  pub fn return_type(&self) -> ValueType {
    match self {
      FunctionOperator::Time | FunctionOperator::Scalar => ValueType::Scalar,
      _ => ValueType::Vector,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOperator {
  Or,
  And,
  Unless,
  Equal,
  NotEqual,
  GreaterThan,
  LessThan,
  GreaterThanOrEqual,
  LessThanOrEqual,
  Plus,
  Minus,
  Multiply,
  Divide,
  Modulo,
  Power,
}

impl BinaryOperator {
  pub fn is_comparison(&self) -> bool {
    matches!(
      self,
      BinaryOperator::Equal
        | BinaryOperator::NotEqual
        | BinaryOperator::GreaterThan
        | BinaryOperator::LessThan
        | BinaryOperator::GreaterThanOrEqual
        | BinaryOperator::LessThanOrEqual
    )
  }

  pub fn is_set_operator(&self) -> bool {
    matches!(
      self,
      BinaryOperator::Or | BinaryOperator::And | BinaryOperator::Unless
    )
  }
}

/// Which side of a binary operation between two vectors may have several series per match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchCardinality {
  OneToOne,
  /// `group_left`: many series on the left for one on the right.
  ManyToOne,
  /// `group_right`: one series on the left for many on the right.
  OneToMany,
}

/// `on(...)` or `ignoring(...)` on a binary operation between two vectors, with an optional
/// `group_left(...)` or `group_right(...)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorMatching {
  pub on: bool,
  pub labels: Vec<String>,
  pub card: MatchCardinality,
  /// Labels copied from the "one" side onto every result.
  pub include: Vec<String>,
}

impl VectorMatching {
  pub fn one_to_one(on: bool, labels: Vec<String>) -> Self {
    VectorMatching {
      on,
      labels,
      card: MatchCardinality::OneToOne,
      include: Vec::new(),
    }
  }
}

/// `by(...)` or `without(...)` on an aggregation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grouping {
  pub without: bool,
  pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VectorSelector {
  pub matchers: Vec<LabelMatcher>,
  pub offset: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
  NumberLiteral(f64),
  StringLiteral(String),
  VectorSelector(VectorSelector),
  MatrixSelector {
    selector: VectorSelector,
    range: i64,
  },
  Aggregation {
    op: AggregationOperator,
    param: Option<Box<Expr>>,
    expr: Box<Expr>,
    grouping: Option<Grouping>,
  },
  FunctionCall {
    func: FunctionOperator,
    args: Vec<Expr>,
  },
  Binary {
    op: BinaryOperator,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
    return_bool: bool,
    matching: Option<VectorMatching>,
  },
  Negation(Box<Expr>),
  Paren(Box<Expr>),
}

impl Expr {
  /// The type this expression evaluates to. Only meaningful for expressions that passed
  /// [Expr::check].
  pub fn value_type(&self) -> ValueType {
    match self {
      Expr::NumberLiteral(_) => ValueType::Scalar,
      Expr::StringLiteral(_) => ValueType::String,
      Expr::VectorSelector(_) => ValueType::Vector,
      Expr::MatrixSelector { .. } => ValueType::Matrix,
      Expr::Aggregation { .. } => ValueType::Vector,
      Expr::FunctionCall { func, .. } => func.return_type(),
      Expr::Binary { lhs, rhs, .. } => {
        if lhs.value_type() == ValueType::Scalar && rhs.value_type() == ValueType::Scalar {
          ValueType::Scalar
        } else {
          ValueType::Vector
        }
      }
      Expr::Negation(expr) | Expr::Paren(expr) => expr.value_type(),
    }
  }

  /// Check the static type rules for this expression and all its children.
  pub fn check(&self) -> Result<(), String> {
    match self {
      Expr::NumberLiteral(_) | Expr::StringLiteral(_) => Ok(()),
      Expr::VectorSelector(selector) => check_selector(selector),
      Expr::MatrixSelector { selector, range } => {
        if *range <= 0 {
          return Err("range in a range selector must be positive".to_owned());
        }
        check_selector(selector)
      }
      Expr::Aggregation {
        op, param, expr, ..
      } => {
        expr.check()?;
        if expr.value_type() != ValueType::Vector {
          return Err(format!(
            "expected an instant vector in aggregation {:?}, got {:?}",
            op,
            expr.value_type()
          ));
        }
        match (op.takes_parameter(), param) {
          (true, Some(param)) => {
            param.check()?;
            if param.value_type() != ValueType::Scalar {
              return Err(format!("expected a scalar parameter in aggregation {:?}", op));
            }
            Ok(())
          }
          (true, None) => Err(format!("aggregation {:?} requires a parameter", op)),
          (false, Some(_)) => Err(format!("aggregation {:?} does not take a parameter", op)),
          (false, None) => Ok(()),
        }
      }
      Expr::FunctionCall { func, args } => {
        let (arg_types, optional) = func.signature();
        let too_many = args.len() > arg_types.len() && !func.is_variadic();
        if too_many || args.len() < arg_types.len() - optional {
          return Err(format!(
            "wrong number of arguments for function {:?}: expected {}, got {}",
            func,
            arg_types.len(),
            args.len()
          ));
        }
        for (index, arg) in args.iter().enumerate() {
          let expected = arg_types.get(index).copied().unwrap_or(ValueType::String);
          arg.check()?;
          if arg.value_type() != expected {
            return Err(format!(
              "expected {:?} argument in function {:?}, got {:?}",
              expected,
              func,
              arg.value_type()
            ));
          }
        }
        check_label_arguments(*func, args)
      }
      Expr::Binary {
        op,
        lhs,
        rhs,
        return_bool,
        matching,
      } => {
        lhs.check()?;
        rhs.check()?;
        let (lhs_type, rhs_type) = (lhs.value_type(), rhs.value_type());
        let allowed = [ValueType::Scalar, ValueType::Vector];
        if !allowed.contains(&lhs_type) || !allowed.contains(&rhs_type) {
          return Err(
            "binary expression must contain only scalar and instant vector types".to_owned(),
          );
        }
        let both_vectors = lhs_type == ValueType::Vector && rhs_type == ValueType::Vector;
        if op.is_set_operator() && !both_vectors {
          return Err(format!(
            "set operator {:?} not allowed in binary scalar expression",
            op
          ));
        }
        if *return_bool && !op.is_comparison() {
          return Err("bool modifier can only be used on comparison operators".to_owned());
        }
        if op.is_comparison()
          && !return_bool
          && lhs_type == ValueType::Scalar
          && rhs_type == ValueType::Scalar
        {
          return Err("comparisons between scalars must use the bool modifier".to_owned());
        }
        if let Some(matching) = matching {
          if !both_vectors {
            return Err("vector matching only allowed between instant vectors".to_owned());
          }
          check_matching(*op, matching)?;
        }
        Ok(())
      }
      Expr::Negation(expr) => {
        expr.check()?;
        if !matches!(expr.value_type(), ValueType::Scalar | ValueType::Vector) {
          return Err("unary expression only allowed on scalars or instant vectors".to_owned());
        }
        Ok(())
      }
      Expr::Paren(expr) => expr.check(),
    }
  }
}

/// The text of a string argument.
pub fn string_value(expr: &Expr) -> Option<&str> {
  match expr {
    Expr::StringLiteral(value) => Some(value),
    Expr::Paren(inner) => string_value(inner),
    _ => None,
  }
}

/// Label names and regular expressions given as literals are checked up front.
fn check_label_arguments(func: FunctionOperator, args: &[Expr]) -> Result<(), String> {
  let strings: Vec<&str> = args.iter().skip(1).filter_map(string_value).collect();
  match func {
    FunctionOperator::LabelReplace => {
      // label_replace(v, dst, replacement, src, regex)
      if !is_valid_label_name(strings[0]) {
        return Err(format!("invalid destination label name in label_replace(): {}", strings[0]));
      }
      Regex::new(&format!("^(?:{})$", strings[3]))
        .map_err(|e| format!("invalid regular expression in label_replace(): {}", e))?;
      Ok(())
    }
    FunctionOperator::LabelJoin => {
      // label_join(v, dst, separator, src...)
      if !is_valid_label_name(strings[0]) {
        return Err(format!("invalid destination label name in label_join(): {}", strings[0]));
      }
      for src in &strings[2..] {
        if !is_valid_label_name(src) {
          return Err(format!("invalid source label name in label_join(): {}", src));
        }
      }
      Ok(())
    }
    _ => Ok(()),
  }
}

fn check_matching(op: BinaryOperator, matching: &VectorMatching) -> Result<(), String> {
  if matching.card == MatchCardinality::OneToOne {
    return Ok(());
  }
  if op.is_set_operator() {
    return Err(format!("no grouping allowed for {:?} operation", op));
  }
  if matching.on {
    if let Some(label) = matching.include.iter().find(|l| matching.labels.contains(l)) {
      return Err(format!(
        "label {:?} must not occur in ON and GROUP clause at once",
        label
      ));
    }
  }
  Ok(())
}

fn check_selector(selector: &VectorSelector) -> Result<(), String> {
  // A selector that matches the empty label set would select every series in the store.
  if selector.matchers.iter().all(|m| m.matches_value("")) {
    return Err("vector selector must contain at least one non-empty matcher".to_owned());
  }
  Ok(())
}
