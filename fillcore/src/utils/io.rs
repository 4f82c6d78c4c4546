// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use std::path::Path;

/// Join a directory path with file path. For example, if the
/// directory path is "a/b" and file path is "c", this will
/// return "a/b/c".
pub fn get_joined_path(dir_path: &str, file_path: &str) -> String {
  Path::new(dir_path)
    .join(file_path)
    .to_string_lossy()
    .into_owned()
}
