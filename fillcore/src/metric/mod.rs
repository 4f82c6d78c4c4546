// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Metric data model shared by the query engine, the backfill walk and the block store.
//!
//! A series is identified by its [labels](labels::Labels), one of which is the reserved
//! metric name label. Points are stored as [MetricPoint](metric_point::MetricPoint)s and
//! compressed into chunks using delta-of-delta encoding when a block is written.

pub mod constants;
pub mod labels;
pub mod matcher;
pub mod metric_point;
pub(crate) mod metricutils;
pub mod sample;
