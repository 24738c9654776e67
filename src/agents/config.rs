// src/agents/config.rs

//! A centralized place for the fixed tuning knobs of agent behavior.

// --- Margin search ---
// New pools enter the margin search from this value; the search window is
// [0, 2 * initial] capped at 1.
pub const STARTING_MARGIN: f64 = 0.25;
pub const MARGIN_SEARCH_DEPTH: u32 = 5;

// --- Inertia ---
// An alternative strategy must beat the current one by at least this much
// before an agent bothers to move. Kills oscillation on infinitesimal
// utility differences.
pub const DEFAULT_ABSOLUTE_UTILITY_THRESHOLD: f64 = 1e-9;
pub const DEFAULT_RELATIVE_UTILITY_THRESHOLD: f64 = 0.0;

// --- Engine defaults ---
pub const DEFAULT_COOLDOWN_ROUNDS: u32 = 5;
pub const DEFAULT_ROUNDS_FOR_CONVERGENCE: u64 = 10;
pub const DEFAULT_REVISION_INTERVAL: u64 = 10;
pub const DEFAULT_MAX_ROUNDS: u64 = 1000;
