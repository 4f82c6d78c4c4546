// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use log::error;
use tsz::decode::Error;
use tsz::stream::{BufferedReader, BufferedWriter};
use tsz::Encode;
use tsz::{Decode, StdDecoder, StdEncoder};

use crate::metric::metric_point::MetricPoint;
use crate::utils::error::BackfillError;

/// The encoder writes a delta-of-delta that does not fit in 32 bits as a truncated value, so a
/// new chunk is started whenever the next point would need more.
const MAX_DELTA_OF_DELTA: i64 = i32::MAX as i64;

/// Sort the points by time, keeping the last of `metric_points` for any repeated timestamp.
pub fn sort_and_dedup_last(metric_points: &mut Vec<MetricPoint>) {
  // Stable, so among equal timestamps the last appended stays last.
  metric_points.sort();
  let mut deduped: Vec<MetricPoint> = Vec::with_capacity(metric_points.len());
  for mp in metric_points.drain(..) {
    match deduped.last_mut() {
      Some(last) if last.get_time() == mp.get_time() => *last = mp,
      _ => deduped.push(mp),
    }
  }
  *metric_points = deduped;
}

/// Decompress the given vector of u8 integers to a MetricPoint vector.
pub fn decompress_metric_point_vector(
  compressed: &[u8],
) -> Result<Vec<MetricPoint>, BackfillError> {
  let r = BufferedReader::new(compressed.to_owned().into_boxed_slice());
  let mut decoder = StdDecoder::new(r);

  let mut metric_points = Vec::new();
  loop {
    match decoder.next() {
      Ok(dp) => {
        metric_points.push(MetricPoint::new_from_tsz_metric_point(dp));
      }
      Err(Error::EndOfStream) => break,
      Err(err) => {
        let err_string = err.to_string();
        error!("Could not decode time series {}", err_string);
        return Err(BackfillError::StorageError(format!(
          "Cannot decode time series. {}",
          err_string
        )));
      }
    };
  }

  Ok(metric_points)
}

/// Compress a sorted, non-empty slice of metric points with non-negative times into a single
/// chunk, using delta-of-delta compression.
fn compress_chunk(metric_points: &[MetricPoint]) -> Vec<u8> {
  let start_time = metric_points[0].get_time() as u64;

  let w = BufferedWriter::new();
  let mut encoder = StdEncoder::new(start_time, w);
  for mp in metric_points {
    encoder.encode(mp.get_tsz_metric_point());
  }

  encoder.close().to_vec()
}

/// Split the given sorted metric points into runs that can each be encoded as one chunk, and
/// compress every run. Returns the compressed chunks in time order.
pub fn compress_metric_point_vector(
  metric_points: &[MetricPoint],
) -> Result<Vec<Vec<u8>>, BackfillError> {
  if let Some(mp) = metric_points.iter().find(|mp| mp.get_time() < 0) {
    return Err(BackfillError::StorageError(format!(
      "Cannot store metric point with negative time {}",
      mp.get_time()
    )));
  }

  let mut chunks = Vec::new();
  let mut chunk_start = 0;
  let mut previous_delta: i64 = 0;

  for i in 1..metric_points.len() {
    let delta = metric_points[i].get_time() - metric_points[i - 1].get_time();
    // The first delta in a chunk is encoded against an implicit previous delta of zero.
    let delta_of_delta = if i == chunk_start + 1 {
      delta
    } else {
      delta - previous_delta
    };

    if delta_of_delta.abs() >= MAX_DELTA_OF_DELTA {
      chunks.push(compress_chunk(&metric_points[chunk_start..i]));
      chunk_start = i;
      previous_delta = 0;
    } else {
      previous_delta = delta;
    }
  }

  if chunk_start < metric_points.len() {
    chunks.push(compress_chunk(&metric_points[chunk_start..]));
  }

  Ok(chunks)
}
