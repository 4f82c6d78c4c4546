// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use log::info;

use crate::metric::labels::Labels;
use crate::metric::metric_point::MetricPoint;
use crate::metric::metricutils::sort_and_dedup_last;
use crate::metric::sample::Sample;
use crate::utils::error::BackfillError;
use crate::utils::io::get_joined_path;

pub const HEAD_DIR_NAME: &str = "wal";
pub const HEAD_FILE_NAME: &str = "head.log";

fn head_log_path(db_path: &str) -> String {
  get_joined_path(&get_joined_path(db_path, HEAD_DIR_NAME), HEAD_FILE_NAME)
}

/// Samples not yet compacted into a block, replayed from the head log.
#[derive(Debug, Default)]
pub struct Head {
  series: BTreeMap<Labels, Vec<MetricPoint>>,
  min_time: Option<i64>,
  max_time: Option<i64>,
}

impl Head {
  /// Replay the head log of the given database. A missing log is an empty head.
  pub fn load(db_path: &str) -> Result<Self, BackfillError> {
    let mut head = Head::default();

    let path = head_log_path(db_path);
    if !Path::new(&path).exists() {
      return Ok(head);
    }

    let reader = BufReader::new(File::open(&path)?);
    for (line_number, line) in reader.lines().enumerate() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let sample: Sample = serde_json::from_str(&line).map_err(|e| {
        BackfillError::StorageError(format!(
          "Cannot replay {} line {}: {}",
          path,
          line_number + 1,
          e
        ))
      })?;
      head.add(sample);
    }

    head.series.values_mut().for_each(sort_and_dedup_last);

    info!("Replayed {} series from head log {}", head.series.len(), path);
    Ok(head)
  }

  fn add(&mut self, sample: Sample) {
    let time = sample.get_time();
    self.min_time = Some(self.min_time.map_or(time, |min| min.min(time)));
    self.max_time = Some(self.max_time.map_or(time, |max| max.max(time)));

    let metric_point = sample.get_metric_point();
    self
      .series
      .entry(sample.into_labels())
      .or_default()
      .push(metric_point);
  }

  pub fn get_series(&self) -> &BTreeMap<Labels, Vec<MetricPoint>> {
    &self.series
  }

  pub fn get_min_time(&self) -> Option<i64> {
    self.min_time
  }

  pub fn get_max_time(&self) -> Option<i64> {
    self.max_time
  }

  pub fn is_empty(&self) -> bool {
    self.series.is_empty()
  }
}

/// Appends samples to the head log of a database.
#[derive(Debug)]
pub struct HeadAppender {
  writer: BufWriter<File>,
}

impl HeadAppender {
  pub fn open(db_path: &str) -> Result<Self, BackfillError> {
    fs::create_dir_all(get_joined_path(db_path, HEAD_DIR_NAME))?;
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(head_log_path(db_path))?;
    Ok(HeadAppender {
      writer: BufWriter::new(file),
    })
  }

  pub fn append(&mut self, sample: &Sample) -> Result<(), BackfillError> {
    serde_json::to_writer(&mut self.writer, sample)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<(), BackfillError> {
    self.writer.flush()?;
    Ok(())
  }
}
