// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

use dotenv::dotenv;

/// Load environment variables (such as RUST_LOG or PROMFILL_* setting overrides)
/// from a ".env" file, if it exists.
pub fn load_env() {
  dotenv().ok();
}
