// src/types/mod.rs

pub mod pool;
pub mod strategy;

/// Pool ids are handed out by the engine's monotonic sequence and are never
/// reused within a run.
pub type PoolId = u64;
/// Agents are identified by their index in the simulation's agent vector.
pub type AgentId = usize;

pub use pool::Pool;
pub use strategy::Strategy;
