//! Loading recording rules from rule files.

pub mod recording_rule;
pub mod rule_file;
