//! Helpers shared by the unit tests.
mod common;
mod test_property;

pub use common::*;
pub use test_property::*;
