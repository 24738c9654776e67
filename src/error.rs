// src/error.rs

use thiserror::Error;

use crate::types::{AgentId, PoolId};

/// Every failure in the core reflects a violated invariant, so there is no
/// retry policy anywhere: callers propagate these and the run aborts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// An agent's strategy references a pool id that is not in the registry.
    #[error("agent {agent} referenced non-existing pool {pool}")]
    InvalidReference { agent: AgentId, pool: PoolId },

    /// An agent tried to close or mutate a pool it does not own.
    #[error("agent {agent} tried to operate on pool {pool} owned by agent {owner}")]
    InvalidOwnership {
        agent: AgentId,
        pool: PoolId,
        owner: AgentId,
    },

    /// A pledge/allocation computation received a non-positive count or stake
    /// where a positive value is required.
    #[error("non-positive allocation: {0}")]
    NonPositiveAllocation(String),

    /// Construction-time parameter validation failed; the simulation must not
    /// start in an invalid state.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
