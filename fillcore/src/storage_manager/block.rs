// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metric::labels::Labels;
use crate::metric::metric_point::MetricPoint;
use crate::metric::metricutils::{
  compress_metric_point_vector, decompress_metric_point_vector, sort_and_dedup_last,
};
use crate::metric::sample::Sample;
use crate::query_manager::promql_time_series::PromQLTimeSeries;
use crate::utils::error::BackfillError;
use crate::utils::io::get_joined_path;
use crate::utils::serialize;

pub const BLOCK_META_FILE_NAME: &str = "meta.json";
pub const BLOCK_SERIES_FILE_NAME: &str = "series.zst";
const BLOCK_TMP_SUFFIX: &str = ".tmp";
const BLOCK_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
/// Metadata for a block.
pub struct BlockMeta {
  /// Unique id, also the name of the block directory.
  id: Uuid,

  /// Least timestamp, inclusive.
  min_time: i64,

  /// Greatest timestamp, inclusive.
  max_time: i64,

  /// Number of samples stored.
  num_samples: u64,

  /// Number of series stored.
  num_series: u64,

  version: u32,
}

impl BlockMeta {
  pub fn get_id(&self) -> Uuid {
    self.id
  }

  pub fn get_min_time(&self) -> i64 {
    self.min_time
  }

  pub fn get_max_time(&self) -> i64 {
    self.max_time
  }

  pub fn get_num_samples(&self) -> u64 {
    self.num_samples
  }

  pub fn get_num_series(&self) -> u64 {
    self.num_series
  }
}

/// A series as written to disk: its labels and the compressed chunks of its points.
#[derive(Debug, Deserialize, Serialize)]
struct StoredSeries {
  labels: Labels,
  chunks: Vec<Vec<u8>>,
}

/// A block read back from disk, with all its series decompressed.
#[derive(Debug)]
pub struct Block {
  meta: BlockMeta,
  series: Vec<PromQLTimeSeries>,
}

impl Block {
  pub fn get_meta(&self) -> &BlockMeta {
    &self.meta
  }

  pub fn get_series(&self) -> &Vec<PromQLTimeSeries> {
    &self.series
  }

  /// Read the block stored in the given directory.
  pub fn read(block_dir_path: &str) -> Result<Self, BackfillError> {
    let meta_path = get_joined_path(block_dir_path, BLOCK_META_FILE_NAME);
    let meta: BlockMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
    if meta.version != BLOCK_FORMAT_VERSION {
      return Err(BackfillError::StorageError(format!(
        "Block {} has unsupported version {}",
        block_dir_path, meta.version
      )));
    }

    let series_path = get_joined_path(block_dir_path, BLOCK_SERIES_FILE_NAME);
    let (stored, _): (Vec<StoredSeries>, u64) = serialize::read(&series_path)?;

    let mut series = Vec::with_capacity(stored.len());
    for stored_series in stored {
      let mut metric_points = Vec::new();
      for chunk in &stored_series.chunks {
        metric_points.extend(decompress_metric_point_vector(chunk)?);
      }
      series.push(PromQLTimeSeries::new(stored_series.labels, metric_points));
    }

    debug!("Read block {} with {} series", meta.id, series.len());
    Ok(Block { meta, series })
  }
}

/// Check whether the given directory holds a complete block.
pub fn is_block_dir(path: &Path) -> bool {
  let is_tmp = path
    .file_name()
    .and_then(|name| name.to_str())
    .map(|name| name.ends_with(BLOCK_TMP_SUFFIX))
    .unwrap_or(true);
  path.is_dir() && !is_tmp && path.join(BLOCK_META_FILE_NAME).is_file()
}

/// Creates immutable blocks from batches of samples.
pub trait BlockWriter {
  /// Write the samples as one new block under `dest_dir_path`. `min_time` and `max_time` are the
  /// inclusive bounds of the sample timestamps. Returns the id of the new block.
  fn create_block(
    &self,
    samples: &[Sample],
    dest_dir_path: &str,
    min_time: i64,
    max_time: i64,
  ) -> Result<Uuid, BackfillError>;
}

/// Writes blocks to the local file system.
#[derive(Debug, Default)]
pub struct FsBlockWriter {}

impl FsBlockWriter {
  pub fn new() -> Self {
    FsBlockWriter {}
  }
}

impl BlockWriter for FsBlockWriter {
  fn create_block(
    &self,
    samples: &[Sample],
    dest_dir_path: &str,
    min_time: i64,
    max_time: i64,
  ) -> Result<Uuid, BackfillError> {
    create_block(samples, dest_dir_path, min_time, max_time)
  }
}

/// Group the samples by series, sort each series by time and keep the last sample written for
/// any repeated timestamp.
fn group_samples(samples: &[Sample]) -> BTreeMap<Labels, Vec<MetricPoint>> {
  let mut series: BTreeMap<Labels, Vec<MetricPoint>> = BTreeMap::new();
  for sample in samples {
    series
      .entry(sample.get_labels().clone())
      .or_default()
      .push(sample.get_metric_point());
  }

  series.values_mut().for_each(sort_and_dedup_last);

  series
}

/// Write the samples as a new block in `dest_dir_path`. The block is written to a temporary
/// directory first and renamed into place, so a block directory is either complete or absent.
pub fn create_block(
  samples: &[Sample],
  dest_dir_path: &str,
  min_time: i64,
  max_time: i64,
) -> Result<Uuid, BackfillError> {
  if samples.is_empty() {
    return Err(BackfillError::EmptyBlock());
  }
  if min_time > max_time {
    return Err(BackfillError::StorageError(format!(
      "Block min time {} is after max time {}",
      min_time, max_time
    )));
  }
  if let Some(sample) = samples
    .iter()
    .find(|s| s.get_time() < min_time || s.get_time() > max_time)
  {
    return Err(BackfillError::StorageError(format!(
      "Sample {} at time {} is outside the block range [{}, {}]",
      sample.get_labels(),
      sample.get_time(),
      min_time,
      max_time
    )));
  }

  let series = group_samples(samples);
  let mut stored = Vec::with_capacity(series.len());
  let mut num_samples = 0;
  for (labels, metric_points) in series {
    num_samples += metric_points.len() as u64;
    stored.push(StoredSeries {
      labels,
      chunks: compress_metric_point_vector(&metric_points)?,
    });
  }

  let id = Uuid::new_v4();
  let meta = BlockMeta {
    id,
    min_time,
    max_time,
    num_samples,
    num_series: stored.len() as u64,
    version: BLOCK_FORMAT_VERSION,
  };

  fs::create_dir_all(dest_dir_path)?;
  let block_dir_path = get_joined_path(dest_dir_path, &id.to_string());
  let tmp_dir_path = format!("{}{}", block_dir_path, BLOCK_TMP_SUFFIX);

  if let Err(e) = write_block_dir(&tmp_dir_path, &meta, &stored) {
    if let Err(remove_error) = fs::remove_dir_all(&tmp_dir_path) {
      warn!(
        "Could not remove incomplete block {}: {}",
        tmp_dir_path, remove_error
      );
    }
    return Err(e);
  }
  fs::rename(&tmp_dir_path, &block_dir_path)?;

  info!(
    "Created block {} with {} samples in {} series, time range [{}, {}]",
    id, meta.num_samples, meta.num_series, min_time, max_time
  );
  Ok(id)
}

fn write_block_dir(
  dir_path: &str,
  meta: &BlockMeta,
  stored: &Vec<StoredSeries>,
) -> Result<(), BackfillError> {
  fs::create_dir_all(dir_path)?;

  let series_path = get_joined_path(dir_path, BLOCK_SERIES_FILE_NAME);
  serialize::write(stored, &series_path, true)?;

  let meta_path = get_joined_path(dir_path, BLOCK_META_FILE_NAME);
  fs::write(&meta_path, serde_json::to_vec_pretty(meta)?)?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use tempdir::TempDir;

  use super::*;

  fn sample(name: &str, instance: &str, time: i64, value: f64) -> Sample {
    Sample::new(
      vec![("__name__", name), ("instance", instance)]
        .into_iter()
        .collect(),
      time,
      value,
    )
  }

  #[test]
  fn test_create_and_read_block() {
    let dir = TempDir::new("block_test").unwrap();
    let dest = dir.path().to_str().unwrap();

    // Out of order, with a repeated timestamp.
    let samples = vec![
      sample("job:up:sum", "a", 3000, 3.0),
      sample("job:up:sum", "b", 1000, 10.0),
      sample("job:up:sum", "a", 1000, 1.0),
      sample("job:up:sum", "a", 3000, 4.0),
      sample("job:up:sum", "a", 2000, 2.0),
    ];

    let id = FsBlockWriter::new()
      .create_block(&samples, dest, 1000, 3000)
      .unwrap();

    let block_dir = get_joined_path(dest, &id.to_string());
    assert!(is_block_dir(Path::new(&block_dir)));
    assert!(!Path::new(&format!("{}{}", block_dir, BLOCK_TMP_SUFFIX)).exists());

    let block = Block::read(&block_dir).unwrap();
    let meta = block.get_meta();
    assert_eq!(meta.get_id(), id);
    assert_eq!(meta.get_min_time(), 1000);
    assert_eq!(meta.get_max_time(), 3000);
    assert_eq!(meta.get_num_series(), 2);
    assert_eq!(meta.get_num_samples(), 4);

    let series = block.get_series();
    assert_eq!(series[0].get_labels().get("instance"), Some("a"));
    assert_eq!(
      series[0].get_metric_points(),
      &vec![
        MetricPoint::new(1000, 1.0),
        MetricPoint::new(2000, 2.0),
        MetricPoint::new(3000, 4.0),
      ]
    );
    assert_eq!(
      series[1].get_metric_points(),
      &vec![MetricPoint::new(1000, 10.0)]
    );
  }

  #[test]
  fn test_empty_block_is_rejected() {
    let dir = TempDir::new("block_test").unwrap();
    let dest = dir.path().to_str().unwrap();

    assert_eq!(
      create_block(&[], dest, 0, 0),
      Err(BackfillError::EmptyBlock())
    );
    assert_eq!(fs::read_dir(dest).unwrap().count(), 0);
  }

  #[test]
  fn test_samples_outside_range_are_rejected() {
    let dir = TempDir::new("block_test").unwrap();
    let dest = dir.path().to_str().unwrap();

    let samples = vec![sample("x", "a", 5000, 1.0)];
    assert!(matches!(
      create_block(&samples, dest, 1000, 4000),
      Err(BackfillError::StorageError(_))
    ));
    assert!(matches!(
      create_block(&samples, dest, 6000, 5000),
      Err(BackfillError::StorageError(_))
    ));
  }

  #[test]
  fn test_negative_time_leaves_no_block() {
    let dir = TempDir::new("block_test").unwrap();
    let dest = dir.path().to_str().unwrap();

    let samples = vec![sample("x", "a", -5, 1.0)];
    assert!(create_block(&samples, dest, -5, -5).is_err());
    assert_eq!(fs::read_dir(dest).unwrap().count(), 0);
  }

  #[test]
  fn test_creates_destination_directory() {
    let dir = TempDir::new("block_test").unwrap();
    let dest = get_joined_path(dir.path().to_str().unwrap(), "nested/out");

    let samples = vec![sample("x", "a", 5, 1.0)];
    let id = create_block(&samples, &dest, 5, 5).unwrap();
    assert!(is_block_dir(Path::new(&get_joined_path(&dest, &id.to_string()))));
  }
}
