// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! PromQL query capability used to evaluate recording rules against stored data.

pub mod ast;
pub mod engine;
pub mod parser;
pub mod promql_time_series;
pub mod promql_vector;
pub mod query_log;
