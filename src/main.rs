// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! Command line interface for backfilling recording rules.
//!
//! Every recording rule in the rule file is evaluated against the data in the source store over
//! the store's time range, and the results are written as new blocks in the destination
//! directory. Settings come from `<config-dir>/default.toml` and `PROMFILL_*` environment
//! variables; command line flags take precedence over both.

use std::env;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use fillcore::backfill_manager::scheduler::{QueryErrorPolicy, RunSummary};
use fillcore::utils::config::Settings;
use fillcore::utils::environment::load_env;
use fillcore::utils::error::BackfillError;
use fillcore::utils::time::parse_duration;
use fillcore::Backfill;

#[derive(Debug, Parser)]
#[command(
  name = "promfill",
  version,
  about = "Backfill Prometheus recording rules from data already in a store"
)]
struct Cli {
  /// Rule file with the recording rules to backfill
  rule_file: String,

  /// Directory of the store to read from
  #[arg(default_value = "data/")]
  db_path: String,

  /// Directory in which new blocks are written
  #[arg(default_value = "data/")]
  dest_path: String,

  /// Maximum number of samples a single query may load
  #[arg(long)]
  max_samples: Option<usize>,

  /// Maximum time a single query may take (e.g. "2m")
  #[arg(long)]
  timeout: Option<String>,

  /// Start of the time range, as Unix seconds or RFC3339. Defaults to the oldest stored sample
  #[arg(long)]
  start: Option<String>,

  /// End of the time range, as Unix seconds or RFC3339. Defaults to the newest stored sample
  #[arg(long)]
  end: Option<String>,

  /// Evaluation interval for groups that do not declare one (e.g. "1m")
  #[arg(long)]
  eval_interval: Option<String>,

  /// Number of samples held in memory before a block is written
  #[arg(long)]
  max_samples_in_mem: Option<usize>,

  /// File in which every executed query is logged
  #[arg(long)]
  query_log_file: Option<String>,

  /// What to do when a query fails: "skip" the instant or "abort" the run
  #[arg(long)]
  on_query_error: Option<String>,

  /// Directory with the configuration files
  #[arg(long, default_value = "config")]
  config_dir: String,
}

fn parse_duration_flag(flag: &str, value: &str) -> Result<i64, BackfillError> {
  parse_duration(value)
    .map_err(|e| BackfillError::InvalidConfiguration(format!("Invalid --{}: {}", flag, e)))
}

/// Override settings with the flags given on the command line.
fn apply_overrides(settings: &mut Settings, cli: &Cli) -> Result<(), BackfillError> {
  let backfill_settings = settings.get_backfill_settings_mut();
  if let Some(eval_interval) = &cli.eval_interval {
    let interval = parse_duration_flag("eval-interval", eval_interval)?;
    backfill_settings.set_default_eval_interval(interval);
  }
  if let Some(max_samples_in_mem) = cli.max_samples_in_mem {
    backfill_settings.set_max_samples_per_block(max_samples_in_mem);
  }
  if let Some(on_query_error) = &cli.on_query_error {
    backfill_settings.set_on_query_error(on_query_error.parse::<QueryErrorPolicy>()?);
  }

  let query_settings = settings.get_query_settings_mut();
  if let Some(max_samples) = cli.max_samples {
    query_settings.set_max_samples(max_samples);
  }
  if let Some(timeout) = &cli.timeout {
    query_settings.set_timeout(parse_duration_flag("timeout", timeout)?);
  }
  if let Some(query_log_file) = &cli.query_log_file {
    query_settings.set_query_log_file(query_log_file);
  }

  Ok(())
}

fn run(cli: &Cli) -> Result<RunSummary, BackfillError> {
  let mut settings = Settings::new(&cli.config_dir)?;
  apply_overrides(&mut settings, cli)?;

  let backfill = Backfill::with_settings(settings);
  backfill.run(
    &cli.rule_file,
    &cli.db_path,
    &cli.dest_path,
    cli.start.as_deref(),
    cli.end.as_deref(),
  )
}

/// Program entry point.
fn main() -> ExitCode {
  // Load environment variables from .env, if available.
  load_env();

  // If log level isn't set, set it to info.
  if env::var("RUST_LOG").is_err() {
    env::set_var("RUST_LOG", "info")
  }
  env_logger::init();

  let cli = Cli::parse();
  match run(&cli) {
    Ok(summary) => {
      info!(
        "Backfilled {} into {}: {}",
        cli.rule_file, cli.dest_path, summary
      );
      ExitCode::SUCCESS
    }
    Err(e) => {
      error!("Backfill of {} failed: {}", cli.rule_file, e);
      ExitCode::FAILURE
    }
  }
}
