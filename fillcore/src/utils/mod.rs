//! Utilities for managing fillcore.

pub(crate) mod custom_serde;
pub(crate) mod serialize;
pub(crate) mod sync;

pub mod config;
pub mod environment;
pub mod error;
pub mod io;
pub mod time;
