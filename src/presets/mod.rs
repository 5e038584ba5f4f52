//! Ready-made properties for composing a property graph.
//!
//! A typical stack is `converter -> memory cache -> source`, where the
//! source talks to the actual storage.

mod converter;
mod map_source;
mod memory_cache;
mod multi_source;
mod split;

pub use converter::*;
pub use map_source::*;
pub use memory_cache::*;
pub use multi_source::*;
pub use split::*;

#[cfg(test)]
mod multi_source_test;
#[cfg(test)]
mod split_test;
