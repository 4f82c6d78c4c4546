//! Walking recording rules over a time range and writing the recorded samples as blocks.

pub mod flusher;
pub mod metrics;
pub mod relabel;
pub mod scheduler;
pub mod time_range;
