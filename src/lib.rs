//! buildtrace - reconstructs a build's file-dependency graph
//!
//! Passively observes a process tree's filesystem activity at the OS level,
//! correlates it into per-process read/write sets, and emits the result as a
//! Ninja build file so tools without native dependency tracking can be made
//! incremental.

pub mod cli;
pub mod engine;
pub mod events;
pub mod model;
pub mod ninja;
pub mod paths;
pub mod postprocess;
pub mod tracer;
