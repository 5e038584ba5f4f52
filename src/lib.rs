//! In-process property broker.
//!
//! Callers submit batches of keyed reads and writes to a [`PropertyServer`].
//! The server routes them through a graph of [`Property`] implementations
//! (caches, converters, sources) on a single task, serializes conflicting
//! requests with a [`LockManager`], and answers each batch once every request
//! in it has a response.

mod config;
mod constants;
mod core;
mod errors;
mod lock;
mod metrics;
mod operator;
mod presets;
mod property;
mod tracker;
pub(crate) mod utils;

pub use core::*;

pub use config::*;
pub use errors::*;
pub use lock::*;
pub use metrics::*;
pub use operator::*;
pub use presets::*;
pub use property::*;
pub use tracker::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
