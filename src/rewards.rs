// src/rewards.rs

//! The pure economics of the system: the two-region reward curve, potential
//! profit, deterministic ranking and the non-myopic stake projection.
//! Nothing in here holds mutable state.

use std::collections::BTreeMap;

use crate::types::{Pool, PoolId};

/// Total rewards handed out per round, normalised to 1 so that stake, pledge
/// and beta can be expressed as fractions of the system total.
pub const TOTAL_ROUND_REWARDS: f64 = 1.0;

/// The standard two-region staking reward curve. Rewards grow with stake up
/// to the saturation threshold `beta` and stay flat beyond it; pledge is
/// rewarded through the `alpha` term, again only up to `beta`.
pub fn pool_reward(stake: f64, pledge: f64, alpha: f64, beta: f64) -> f64 {
    let pledge_ = pledge.min(beta);
    let stake_ = stake.min(beta);
    (TOTAL_ROUND_REWARDS / (1.0 + alpha))
        * (stake_ + pledge_ * alpha * (stake_ - pledge_ * (beta - stake_) / beta) / beta)
}

/// The reward a fully-pledged, zero-margin pool of the given stake would
/// yield, net of its operating cost. This is the baseline desirability score:
/// a pool with margin 0 is exactly this desirable.
pub fn potential_profit(stake: f64, cost: f64, alpha: f64, beta: f64) -> f64 {
    let relevant_stake = stake.min(beta);
    pool_reward(relevant_stake, relevant_stake, alpha, beta) - cost
}

/// Assigns ordinal ranks 1..=N to the given scores, descending. Ties on the
/// primary score are broken by the secondary score (descending) and, failing
/// that, by id (ascending).
///
/// Every ranking decision in the system (non-myopic stake, pool retirement,
/// the perfect-strategy margin) goes through this one function so that the
/// same tie-breaking rule is applied everywhere. Two call sites disagreeing
/// on tie order is enough to make agents oscillate forever.
pub fn rank_descending(
    scores: &BTreeMap<PoolId, f64>,
    tiebreak: &BTreeMap<PoolId, f64>,
) -> BTreeMap<PoolId, usize> {
    let mut ordered: Vec<(PoolId, f64, f64)> = scores
        .iter()
        .map(|(&id, &score)| (id, score, tiebreak.get(&id).copied().unwrap_or(0.0)))
        .collect();
    ordered.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.0.cmp(&b.0))
    });
    ordered
        .into_iter()
        .enumerate()
        .map(|(i, (id, _, _))| (id, i + 1))
        .collect()
}

/// Projects the stake a pool would settle at if every delegator played the
/// desirability ranking: the top `k` pools end up saturated, the pool on the
/// k-boundary absorbs whatever stake is left over, and everyone below the
/// boundary is abandoned down to their pledge.
///
/// Current stake is a bad predictor of long-run rewards, so non-myopic agents
/// evaluate pools through this projection instead.
pub fn non_myopic_pool_stake(
    pool_id: PoolId,
    pools: &BTreeMap<PoolId, Pool>,
    beta: f64,
    k: usize,
) -> f64 {
    let desirabilities: BTreeMap<PoolId, f64> =
        pools.iter().map(|(&id, p)| (id, p.desirability())).collect();
    let potential_profits: BTreeMap<PoolId, f64> = pools
        .iter()
        .map(|(&id, p)| (id, p.potential_profit))
        .collect();
    let ranks = rank_descending(&desirabilities, &potential_profits);

    let pool = &pools[&pool_id];
    let rank = ranks[&pool_id];
    if rank < k {
        beta
    } else if rank == k {
        // The boundary pool gets the stake that the saturated pools above it
        // cannot absorb, never less than its own pledge.
        let total: f64 = pools.values().map(|p| p.stake).sum();
        let remainder = total - (k - 1) as f64 * beta;
        remainder.min(beta).max(pool.pledge)
    } else {
        pool.pledge
    }
}
