// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::fs::File;
use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::utils::error::BackfillError;

// Level for zstd compression. Higher level means higher compression ratio, at the expense of
// speed of compression and decompression.
pub const COMPRESSION_LEVEL: i32 = 15;

/// Compress and write the given value to the given file. Returns the number of bytes before and
/// after compression.
pub fn write<T: Serialize>(
  to_write: &T,
  file_path: &str,
  sync_after_write: bool,
) -> Result<(u64, u64), BackfillError> {
  let input = serde_json::to_vec(&to_write)?;
  let uncompressed_length = input.len() as u64;

  let mut output = Vec::new();
  zstd::stream::copy_encode(input.as_slice(), &mut output, COMPRESSION_LEVEL)?;

  let mut file = File::options()
    .create(true)
    .write(true)
    .truncate(true)
    .open(file_path)?;
  file.write_all(output.as_slice())?;

  if sync_after_write {
    // Blocks are immutable once written, so make sure the bytes are on disk before the
    // block directory is renamed into place.
    file.sync_all()?;
  }

  Ok((uncompressed_length, output.len() as u64))
}

/// Read a value from the given file. Returns the value and the number of bytes read after
/// decompression.
pub fn read<T: DeserializeOwned>(file_path: &str) -> Result<(T, u64), BackfillError> {
  let compressed = std::fs::read(file_path)?;
  let data = zstd::decode_all(compressed.as_slice())?;
  let retval: T = serde_json::from_slice(&data)?;
  Ok((retval, data.len() as u64))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use tempfile::NamedTempFile;

  #[test]
  fn test_serialize_btree_map() {
    let file = NamedTempFile::new().expect("Could not create temporary file");
    let file_path = file.path().to_str().unwrap();
    let num_keys = 8;
    let prefix = "series#";

    let mut expected: BTreeMap<String, u32> = BTreeMap::new();
    for i in 1..=num_keys {
      expected.insert(format!("{prefix}{i}"), i);
    }
    let (uncompressed, compressed) = write(&expected, file_path, false).unwrap();
    assert!(uncompressed > 0);
    assert!(compressed > 0);

    let (received, num_bytes_read): (BTreeMap<String, u32>, _) = read(file_path).unwrap();
    assert_eq!(received, expected);

    // The number of bytes read is uncompressed, so it should be equal to the uncompressed number
    // of bytes written.
    assert_eq!(num_bytes_read, uncompressed);
  }

  #[test]
  fn test_read_garbage() {
    let mut file = NamedTempFile::new().expect("Could not create temporary file");
    file.write_all(b"definitely not zstd").unwrap();
    let file_path = file.path().to_str().unwrap();

    let result: Result<(Vec<String>, u64), BackfillError> = read(file_path);
    assert!(matches!(result, Err(BackfillError::IOError(_))));
  }
}
