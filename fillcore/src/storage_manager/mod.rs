// This code is licensed under Elastic License 2.0
// https://www.elastic.co/licensing/elastic-license

//! On-disk storage: immutable blocks, the head log and the database view over both.
//!
//! Layout of a database directory:
//!
//! ```text
//! <db>/<block uuid>/meta.json
//! <db>/<block uuid>/series.zst
//! <db>/wal/head.log
//! <db>/lock
//! ```

pub mod block;
pub mod db;
pub mod head;
