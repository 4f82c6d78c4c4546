// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use log::{debug, error};
use uuid::Uuid;

use crate::backfill_manager::metrics::BackfillMetrics;
use crate::metric::sample::Sample;
use crate::storage_manager::block::BlockWriter;
use crate::utils::error::BackfillError;
use crate::utils::sync::Arc;

/// Upper bound on the samples reserved up front for a batch. Larger batches grow on demand.
const MAX_RESERVED_SAMPLES: usize = 4096;

/// Samples waiting to be written, with the bounds of their timestamps.
#[derive(Debug)]
pub struct Batch {
  samples: Vec<Sample>,
  min_time: i64,
  max_time: i64,
}

impl Batch {
  pub fn with_capacity(capacity: usize) -> Self {
    Batch {
      samples: Vec::with_capacity(capacity),
      min_time: i64::MAX,
      max_time: i64::MIN,
    }
  }

  pub fn push(&mut self, sample: Sample) {
    self.min_time = self.min_time.min(sample.get_time());
    self.max_time = self.max_time.max(sample.get_time());
    self.samples.push(sample);
  }

  /// Drop every sample and reset the bounds.
  pub fn clear(&mut self) {
    self.samples.clear();
    self.min_time = i64::MAX;
    self.max_time = i64::MIN;
  }

  pub fn get_samples(&self) -> &[Sample] {
    &self.samples
  }

  pub fn get_min_time(&self) -> i64 {
    self.min_time
  }

  pub fn get_max_time(&self) -> i64 {
    self.max_time
  }

  pub fn len(&self) -> usize {
    self.samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.samples.is_empty()
  }
}

/// Collects recorded samples and writes them out as a block every time `threshold` samples
/// have accumulated.
pub struct BatchFlusher<'a> {
  writer: &'a dyn BlockWriter,
  dest_dir_path: String,
  threshold: usize,
  batch: Batch,
  blocks: Vec<Uuid>,
  metrics: Arc<BackfillMetrics>,
}

impl<'a> BatchFlusher<'a> {
  pub fn new(
    writer: &'a dyn BlockWriter,
    dest_dir_path: &str,
    threshold: usize,
    metrics: Arc<BackfillMetrics>,
  ) -> Result<Self, BackfillError> {
    if threshold == 0 {
      return Err(BackfillError::InvalidConfiguration(
        "The number of samples held in memory before a flush must be positive".to_owned(),
      ));
    }

    Ok(BatchFlusher {
      writer,
      dest_dir_path: dest_dir_path.to_owned(),
      threshold,
      batch: Batch::with_capacity(threshold.min(MAX_RESERVED_SAMPLES)),
      blocks: Vec::new(),
      metrics,
    })
  }

  /// Add a sample, writing a block if the batch is full.
  pub fn append(&mut self, sample: Sample) -> Result<Option<Uuid>, BackfillError> {
    self.batch.push(sample);
    self.metrics.increment_samples_appended();
    if self.batch.len() >= self.threshold {
      return self.flush();
    }
    Ok(None)
  }

  /// Write the pending samples as a block. Does nothing when there are no pending samples.
  pub fn flush(&mut self) -> Result<Option<Uuid>, BackfillError> {
    if self.batch.is_empty() {
      return Ok(None);
    }

    let id = self
      .writer
      .create_block(
        self.batch.get_samples(),
        &self.dest_dir_path,
        self.batch.get_min_time(),
        self.batch.get_max_time(),
      )
      .map_err(|e| {
        error!(
          "Could not write block of {} samples to {}: {}",
          self.batch.len(),
          self.dest_dir_path,
          e
        );
        e
      })?;

    debug!(
      "Flushed {} samples in [{}, {}] to block {}",
      self.batch.len(),
      self.batch.get_min_time(),
      self.batch.get_max_time(),
      id
    );
    self.batch.clear();
    self.blocks.push(id);
    self.metrics.increment_blocks_created();
    Ok(Some(id))
  }

  pub fn get_batch(&self) -> &Batch {
    &self.batch
  }

  /// Ids of the blocks written so far, oldest first.
  pub fn get_blocks(&self) -> &Vec<Uuid> {
    &self.blocks
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metric::labels::Labels;
  use crate::utils::sync::Mutex;

  /// Records the bounds of every block it is asked to write.
  #[derive(Default)]
  struct RecordingWriter {
    calls: Mutex<Vec<(i64, i64, usize)>>,
    fail: bool,
  }

  impl BlockWriter for RecordingWriter {
    fn create_block(
      &self,
      samples: &[Sample],
      _dest_dir_path: &str,
      min_time: i64,
      max_time: i64,
    ) -> Result<Uuid, BackfillError> {
      if self.fail {
        return Err(BackfillError::StorageError("disk full".to_owned()));
      }
      self
        .calls
        .lock()
        .push((min_time, max_time, samples.len()));
      Ok(Uuid::new_v4())
    }
  }

  fn sample(time: i64) -> Sample {
    Sample::new(
      vec![("__name__", "recorded")].into_iter().collect::<Labels>(),
      time,
      1.0,
    )
  }

  #[test]
  fn test_flush_at_threshold() {
    let writer = RecordingWriter::default();
    let metrics = Arc::new(BackfillMetrics::new());
    let mut flusher = BatchFlusher::new(&writer, "dest", 2, metrics.clone()).unwrap();

    let mut flushed = Vec::new();
    for time in [5, 1, 3, 2, 4] {
      flushed.push(flusher.append(sample(time)).unwrap().is_some());
    }
    assert_eq!(flushed, vec![false, true, false, true, false]);
    assert_eq!(flusher.get_batch().len(), 1);

    assert!(flusher.flush().unwrap().is_some());
    assert_eq!(
      *writer.calls.lock(),
      vec![(1, 5, 2), (2, 3, 2), (4, 4, 1)]
    );
    assert_eq!(flusher.get_blocks().len(), 3);
    assert_eq!(metrics.get_blocks_created(), 3);
    assert_eq!(metrics.get_samples_appended(), 5);

    // Bounds are reset after a flush.
    assert!(flusher.get_batch().is_empty());
    assert_eq!(flusher.get_batch().get_min_time(), i64::MAX);
    assert_eq!(flusher.get_batch().get_max_time(), i64::MIN);
  }

  #[test]
  fn test_empty_flush_is_a_noop() {
    let writer = RecordingWriter::default();
    let mut flusher =
      BatchFlusher::new(&writer, "dest", 10, Arc::new(BackfillMetrics::new())).unwrap();
    assert_eq!(flusher.flush().unwrap(), None);
    assert!(writer.calls.lock().is_empty());
  }

  #[test]
  fn test_large_threshold() {
    let writer = RecordingWriter::default();
    let mut flusher =
      BatchFlusher::new(&writer, "dest", usize::MAX, Arc::new(BackfillMetrics::new())).unwrap();
    assert!(flusher.get_batch().samples.capacity() <= MAX_RESERVED_SAMPLES);

    for time in 0..(MAX_RESERVED_SAMPLES as i64 + 10) {
      assert_eq!(flusher.append(sample(time)).unwrap(), None);
    }
    assert_eq!(flusher.get_batch().len(), MAX_RESERVED_SAMPLES + 10);
    assert!(writer.calls.lock().is_empty());

    assert!(flusher.flush().unwrap().is_some());
    assert_eq!(
      *writer.calls.lock(),
      vec![(0, MAX_RESERVED_SAMPLES as i64 + 9, MAX_RESERVED_SAMPLES + 10)]
    );
  }

  #[test]
  fn test_zero_threshold() {
    let writer = RecordingWriter::default();
    assert!(matches!(
      BatchFlusher::new(&writer, "dest", 0, Arc::new(BackfillMetrics::new())),
      Err(BackfillError::InvalidConfiguration(_))
    ));
  }

  #[test]
  fn test_write_failure_is_returned() {
    let writer = RecordingWriter {
      fail: true,
      ..Default::default()
    };
    let mut flusher =
      BatchFlusher::new(&writer, "dest", 1, Arc::new(BackfillMetrics::new())).unwrap();
    assert_eq!(
      flusher.append(sample(1)),
      Err(BackfillError::StorageError("disk full".to_owned()))
    );
    assert!(flusher.get_blocks().is_empty());
  }
}
