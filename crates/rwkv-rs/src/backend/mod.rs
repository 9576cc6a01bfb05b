//! Contract between the graph builder and the engines that execute graphs.
pub mod spec;
