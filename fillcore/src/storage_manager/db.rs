// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::metric::labels::Labels;
use crate::metric::matcher::{matches_all, LabelMatcher};
use crate::metric::metric_point::MetricPoint;
use crate::metric::metricutils::sort_and_dedup_last;
use crate::query_manager::engine::Queryable;
use crate::query_manager::promql_time_series::PromQLTimeSeries;
use crate::storage_manager::block::{is_block_dir, Block};
use crate::storage_manager::head::Head;
use crate::utils::error::BackfillError;

pub const LOCK_FILE_NAME: &str = "lock";

/// Exclusive lock on a database directory, held until dropped.
#[derive(Debug)]
pub struct DirLock {
  path: PathBuf,
}

impl DirLock {
  pub fn acquire(db_path: &str) -> Result<Self, BackfillError> {
    let path = Path::new(db_path).join(LOCK_FILE_NAME);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
      Ok(_) => {
        debug!("Acquired lock {}", path.display());
        Ok(DirLock { path })
      }
      Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(BackfillError::StorageError(format!(
        "Database {} is locked by another process (lock file {})",
        db_path,
        path.display()
      ))),
      Err(e) => Err(e.into()),
    }
  }
}

impl Drop for DirLock {
  fn drop(&mut self) {
    if let Err(e) = fs::remove_file(&self.path) {
      warn!("Could not release lock {}: {}", self.path.display(), e);
    }
  }
}

/// A read-only view of a database: every persisted block plus the head.
#[derive(Debug)]
pub struct Db {
  path: String,
  blocks: Vec<Block>,
  head: Head,
  _lock: Option<DirLock>,
}

impl Db {
  /// Open the database in the given directory, optionally locking it for the lifetime of the
  /// returned handle.
  pub fn open(path: &str, use_lockfile: bool) -> Result<Self, BackfillError> {
    if !Path::new(path).is_dir() {
      return Err(BackfillError::StorageError(format!(
        "Database directory {} does not exist",
        path
      )));
    }

    let lock = if use_lockfile {
      Some(DirLock::acquire(path)?)
    } else {
      None
    };

    let mut block_paths: Vec<PathBuf> = fs::read_dir(path)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|p| is_block_dir(p))
      .collect();
    block_paths.sort();

    let mut blocks = Vec::with_capacity(block_paths.len());
    for block_path in block_paths {
      let block_path = block_path.to_str().ok_or_else(|| {
        BackfillError::StorageError(format!("Invalid block path {}", block_path.display()))
      })?;
      blocks.push(Block::read(block_path)?);
    }

    // Overlapping blocks are merged in this order, so later blocks win on repeated timestamps.
    blocks.sort_by_key(|block| {
      let meta = block.get_meta();
      (meta.get_min_time(), meta.get_max_time(), meta.get_id())
    });

    let head = Head::load(path)?;

    info!("Opened database {} with {} blocks", path, blocks.len());
    Ok(Db {
      path: path.to_owned(),
      blocks,
      head,
      _lock: lock,
    })
  }

  pub fn get_path(&self) -> &str {
    &self.path
  }

  pub fn get_blocks(&self) -> &Vec<Block> {
    &self.blocks
  }

  /// Least timestamp across all blocks and the head, if there is any data.
  pub fn get_min_time(&self) -> Option<i64> {
    self
      .blocks
      .iter()
      .map(|b| b.get_meta().get_min_time())
      .chain(self.head.get_min_time())
      .min()
  }

  /// Greatest timestamp across all blocks and the head, if there is any data.
  pub fn get_max_time(&self) -> Option<i64> {
    self
      .blocks
      .iter()
      .map(|b| b.get_meta().get_max_time())
      .chain(self.head.get_max_time())
      .max()
  }
}

impl Queryable for Db {
  fn select(
    &self,
    matchers: &[LabelMatcher],
    min_time: i64,
    max_time: i64,
  ) -> Vec<PromQLTimeSeries> {
    let mut merged: BTreeMap<Labels, Vec<MetricPoint>> = BTreeMap::new();
    let in_range = |mp: &&MetricPoint| mp.get_time() >= min_time && mp.get_time() <= max_time;

    for block in &self.blocks {
      let meta = block.get_meta();
      if meta.get_max_time() < min_time || meta.get_min_time() > max_time {
        continue;
      }
      for ts in block.get_series() {
        if matches_all(matchers, ts.get_labels()) {
          merged
            .entry(ts.get_labels().clone())
            .or_default()
            .extend(ts.get_metric_points().iter().filter(in_range).cloned());
        }
      }
    }

    for (labels, metric_points) in self.head.get_series() {
      if matches_all(matchers, labels) {
        merged
          .entry(labels.clone())
          .or_default()
          .extend(metric_points.iter().filter(in_range).cloned());
      }
    }

    merged
      .into_iter()
      .filter(|(_, metric_points)| !metric_points.is_empty())
      .map(|(labels, mut metric_points)| {
        // Blocks may overlap, and the head is merged last.
        sort_and_dedup_last(&mut metric_points);
        PromQLTimeSeries::new(labels, metric_points)
      })
      .collect()
  }
}
