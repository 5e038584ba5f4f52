mod common;
mod concurrent_batches;
mod custom_property;
mod layered_graph;
