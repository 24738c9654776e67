// src/lib.rs

// === 1. Declare all the top-level modules ===
pub mod agents;
pub mod error;
pub mod rewards;
pub mod setup;
pub mod simulation;
pub mod types;

// === 2. Re-export the public-facing components to create a clean API ===

// --- From `agents` ---
pub use agents::stakeholder::{AgentProfile, IdSequence, MarginRule, Stakeholder, SystemView};

// --- From `error` ---
pub use error::SimError;

// --- From our `simulation` engine ---
pub use simulation::{
    ActivationPolicy, EraOverride, Phase, RoundMetrics, Simulation, SimulationConfig,
};

// --- From `types` ---
pub use types::{AgentId, Pool, PoolId, Strategy};
