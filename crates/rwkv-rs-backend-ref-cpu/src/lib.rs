//! Reference CPU executor for RWKV graphs.
//!
//! Evaluates every node on the host with straightforward loops. Matrix products are split
//! across a rayon pool; every output element is still accumulated in one fixed order, so
//! results do not depend on the thread count or on how many tokens a graph processes.
pub mod cpu;

pub use cpu::CpuExecutor;
