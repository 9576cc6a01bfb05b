//! Graph construction primitives and the functional layer built on top of them.
//!
//! `graph` owns tensor storage and the operation records; `functional` adds the custom
//! element-wise kernels and normalization helpers the recurrent layers are assembled from.
pub mod functional;
pub mod graph;
