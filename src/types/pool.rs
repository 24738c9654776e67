// src/types/pool.rs

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::SimError;
use crate::rewards::{pool_reward, potential_profit};
use crate::types::{AgentId, PoolId};

/// Delegations this close to zero are treated as fully withdrawn, so that
/// floating point residue does not keep ghost delegators around.
const DELEGATION_EPSILON: f64 = 1e-12;

/// A stake pool's economic state. The stake invariant (stake = pledge + sum
/// of delegations) is maintained by `update_delegation`; nothing outside the
/// pool and the engine's commit path mutates these fields directly.
#[derive(Debug, Clone, Serialize)]
pub struct Pool {
    pub id: PoolId,
    pub owner: AgentId,
    pub pledge: f64,
    pub margin: f64,
    pub stake: f64,
    pub cost: f64,
    /// A pool pledged at or above saturation accepts no outside delegation.
    pub is_private: bool,
    /// Cached baseline desirability, recomputed whenever pledge or cost change.
    pub potential_profit: f64,
    pub delegators: BTreeMap<AgentId, f64>,
}

impl Pool {
    pub fn new(
        id: PoolId,
        owner: AgentId,
        pledge: f64,
        margin: f64,
        cost: f64,
        alpha: f64,
        beta: f64,
    ) -> Self {
        Self {
            id,
            owner,
            pledge,
            margin,
            stake: pledge,
            cost,
            is_private: pledge >= beta,
            potential_profit: potential_profit(pledge, cost, alpha, beta),
            delegators: BTreeMap::new(),
        }
    }

    /// The delegator-facing score of this pool: its best-case profit after
    /// the operator's cut. A pool running at a loss has zero desirability, it
    /// never goes negative.
    pub fn desirability(&self) -> f64 {
        ((1.0 - self.margin) * self.potential_profit).max(0.0)
    }

    /// Desirability as a myopic agent sees it, using the pool's current stake
    /// instead of the cached saturation-level potential profit.
    pub fn myopic_desirability(&self, alpha: f64, beta: f64) -> f64 {
        let current_profit = pool_reward(self.stake, self.pledge, alpha, beta) - self.cost;
        ((1.0 - self.margin) * current_profit).max(0.0)
    }

    /// Recomputes the cached potential profit after a pledge or cost change.
    pub fn set_potential_profit(&mut self, alpha: f64, beta: f64) {
        self.potential_profit = potential_profit(self.pledge, self.cost, alpha, beta);
    }

    /// Applies a delegation delta for one agent, keeping the pool's total
    /// stake and the delegator entry in sync. A delta that would drive the
    /// agent's delegation negative is rejected.
    pub fn update_delegation(&mut self, delta: f64, delegator: AgentId) -> Result<(), SimError> {
        let current = self.delegators.get(&delegator).copied().unwrap_or(0.0);
        let updated = current + delta;
        if updated < -DELEGATION_EPSILON {
            return Err(SimError::NonPositiveAllocation(format!(
                "agent {} would end up with negative delegation ({}) in pool {}",
                delegator, updated, self.id
            )));
        }
        self.stake += delta;
        if updated <= DELEGATION_EPSILON {
            self.delegators.remove(&delegator);
        } else {
            self.delegators.insert(delegator, updated);
        }
        Ok(())
    }
}
