use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempdir::TempDir;

use fillcore::metric::labels::Labels;
use fillcore::metric::sample::Sample;
use fillcore::storage_manager::block::{create_block, is_block_dir};

const RULES: &str = r#"
groups:
  - name: requests
    interval: 1m
    rules:
      - record: job:requests:rate1m
        expr: sum by (job) (rate(requests_total[1m]))
"#;

/// A counter increasing by one every second, scraped every 15s for ten minutes.
fn create_source(db_path: &str) {
  let samples: Vec<Sample> = (0..=600_000)
    .step_by(15_000)
    .map(|time| {
      let labels: Labels = vec![("__name__", "requests_total"), ("job", "api")]
        .into_iter()
        .collect();
      Sample::new(labels, time, (time / 1000) as f64)
    })
    .collect();
  create_block(&samples, db_path, 0, 600_000).unwrap();
}

fn count_blocks(dir_path: &str) -> usize {
  if !Path::new(dir_path).exists() {
    return 0;
  }
  fs::read_dir(dir_path)
    .unwrap()
    .filter(|entry| is_block_dir(&entry.as_ref().unwrap().path()))
    .count()
}

struct Dirs {
  _root: TempDir,
  config: String,
  source: String,
  dest: String,
  rules: String,
}

fn create_dirs(rules: &str) -> Dirs {
  let root = TempDir::new("cli_test").unwrap();
  let path = |name: &str| root.path().join(name).to_str().unwrap().to_owned();
  let dirs = Dirs {
    config: path("config"),
    source: path("source"),
    dest: path("dest"),
    rules: path("rules.yml"),
    _root: root,
  };
  fs::create_dir_all(&dirs.config).unwrap();
  fs::create_dir_all(&dirs.source).unwrap();
  fs::write(dirs.rules.as_str(), rules).unwrap();
  dirs
}

#[test]
fn test_backfill_writes_blocks() {
  let dirs = create_dirs(RULES);
  create_source(&dirs.source);
  let query_log = format!("{}/queries.log", dirs.config);

  Command::cargo_bin("promfill")
    .unwrap()
    .args([
      dirs.rules.as_str(),
      dirs.source.as_str(),
      dirs.dest.as_str(),
      "--config-dir",
      dirs.config.as_str(),
      "--max-samples-in-mem",
      "4",
      "--start",
      "60",
      "--query-log-file",
      query_log.as_str(),
    ])
    .assert()
    .success();

  // Instants every minute in (60s, 600s] give 9 samples, written 4 at a time.
  assert_eq!(count_blocks(&dirs.dest), 3);
  assert_eq!(count_blocks(&dirs.source), 1);
  assert_eq!(fs::read_to_string(&query_log).unwrap().lines().count(), 9);
}

#[test]
fn test_invalid_rule_file_fails() {
  let dirs = create_dirs(
    "groups:\n  - name: g\n    rules:\n      - record: \"bad name\"\n        expr: up\n",
  );
  create_source(&dirs.source);

  Command::cargo_bin("promfill")
    .unwrap()
    .args([
      dirs.rules.as_str(),
      dirs.source.as_str(),
      dirs.dest.as_str(),
      "--config-dir",
      dirs.config.as_str(),
    ])
    .assert()
    .failure()
    .code(1);
  assert_eq!(count_blocks(&dirs.dest), 0);
}

#[test]
fn test_invalid_time_range_fails() {
  let dirs = create_dirs(RULES);
  create_source(&dirs.source);

  Command::cargo_bin("promfill")
    .unwrap()
    .args([
      dirs.rules.as_str(),
      dirs.source.as_str(),
      dirs.dest.as_str(),
      "--config-dir",
      dirs.config.as_str(),
      "--start",
      "500",
      "--end",
      "400",
    ])
    .assert()
    .failure()
    .code(1);
}

#[test]
fn test_missing_rule_file_argument() {
  Command::cargo_bin("promfill").unwrap().assert().failure();
}
