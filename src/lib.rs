//! Live memory-allocation profiler.
//!
//! Kernel probes record allocations, frees, slab cache activity and syscall
//! timings into shared tables. This crate drains those tables on a fixed
//! interval, folds raw records into per-stack aggregates, resolves stacks to
//! symbols and either prints a report or persists a JSON snapshot.

pub mod agent;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod export;
pub mod resolve;
pub mod sink;
pub mod tracer;
