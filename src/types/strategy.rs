// src/types/strategy.rs

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::{Pool, PoolId};

/// An agent's intended role for a round, staged as a value and committed
/// atomically. `allocations` maps pool id to the stake the agent delegates
/// there; an operator's pledges and margins are kept 1:1 with its owned
/// pools in stable id order.
#[derive(Debug, Clone, Serialize)]
pub enum Strategy {
    Delegator {
        allocations: BTreeMap<PoolId, f64>,
    },
    Operator {
        pledges: Vec<f64>,
        margins: Vec<f64>,
        allocations: BTreeMap<PoolId, f64>,
        owned_pools: BTreeMap<PoolId, Pool>,
    },
}

impl Default for Strategy {
    /// Agents start out as delegators with nothing allocated.
    fn default() -> Self {
        Self::Delegator {
            allocations: BTreeMap::new(),
        }
    }
}

impl Strategy {
    pub fn delegator(allocations: BTreeMap<PoolId, f64>) -> Self {
        Self::Delegator { allocations }
    }

    pub fn is_pool_operator(&self) -> bool {
        matches!(self, Self::Operator { .. })
    }

    pub fn allocations(&self) -> &BTreeMap<PoolId, f64> {
        match self {
            Self::Delegator { allocations } | Self::Operator { allocations, .. } => allocations,
        }
    }

    pub fn allocations_mut(&mut self) -> &mut BTreeMap<PoolId, f64> {
        match self {
            Self::Delegator { allocations } | Self::Operator { allocations, .. } => allocations,
        }
    }

    /// The pools this strategy operates, empty for delegators.
    pub fn owned_pools(&self) -> Option<&BTreeMap<PoolId, Pool>> {
        match self {
            Self::Delegator { .. } => None,
            Self::Operator { owned_pools, .. } => Some(owned_pools),
        }
    }

    pub fn owned_pool_ids(&self) -> BTreeSet<PoolId> {
        self.owned_pools()
            .map(|pools| pools.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn num_pools(&self) -> usize {
        self.owned_pools().map(BTreeMap::len).unwrap_or(0)
    }
}
