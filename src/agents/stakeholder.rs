// src/agents/stakeholder.rs

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::agents::config::{MARGIN_SEARCH_DEPTH, STARTING_MARGIN};
use crate::error::SimError;
use crate::rewards::{non_myopic_pool_stake, pool_reward, potential_profit, rank_descending};
use crate::types::{AgentId, Pool, PoolId, Strategy};

/// The rule an operator uses to pick a pool's margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarginRule {
    /// Fixed-depth bisection maximizing the operator's own utility.
    BinarySearch,
    /// Margin derived from the potential-profit ranking of all agents:
    /// agents ranked within the top k keep just enough edge over the
    /// (k+1)-ranked agent to stay competitive, everyone else charges nothing.
    PerfectStrategy,
}

/// Fixed per-agent inputs, sampled once at initialization.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AgentProfile {
    pub stake: f64,
    pub cost: f64,
    pub is_myopic: bool,
    pub abstains: bool,
}

/// A read-only snapshot of the global state handed to an agent while it
/// computes its move. Agents never touch the live registry; they stage a
/// strategy and the engine applies it through the commit protocol.
pub struct SystemView<'a> {
    pub pools: &'a BTreeMap<PoolId, Pool>,
    pub profiles: &'a [AgentProfile],
    pub alpha: f64,
    pub beta: f64,
    pub k: usize,
    pub total_stake: f64,
    pub common_cost: f64,
    pub relative_utility_threshold: f64,
    pub absolute_utility_threshold: f64,
    pub pool_splitting: bool,
    pub margin_rule: MarginRule,
}

/// Monotonic pool id allocator. Ids handed out for hypothetical pools that
/// never get committed are returned wholesale via `rewind_to`, so the
/// committed id space stays gap-free per decision.
#[derive(Debug, Default)]
pub struct IdSequence {
    next: PoolId,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> PoolId {
        self.next += 1;
        self.next
    }

    /// Position to rewind to if everything allocated after it is discarded.
    pub fn mark(&self) -> PoolId {
        self.next
    }

    pub fn rewind_to(&mut self, mark: PoolId) {
        self.next = mark;
    }
}

/// One selfish stakeholder. Every round it re-evaluates whether to keep its
/// current strategy, delegate elsewhere, or operate pools, and stages the
/// highest-utility option as a pending strategy.
#[derive(Debug, Serialize)]
pub struct Stakeholder {
    pub id: AgentId,
    pub stake: f64,
    pub cost: f64,
    pub is_myopic: bool,
    pub abstains: bool,
    /// Rounds left during which a just-opened pool may not be closed.
    pub cooldown: u32,
    pub strategy: Strategy,
    pub pending: Option<Strategy>,
}

impl Stakeholder {
    pub fn new(id: AgentId, profile: &AgentProfile) -> Self {
        Self {
            id,
            stake: profile.stake,
            cost: profile.cost,
            is_myopic: profile.is_myopic,
            abstains: profile.abstains,
            cooldown: 0,
            strategy: Strategy::default(),
            pending: None,
        }
    }

    /// The strategy-search entry point: evaluates the current strategy
    /// (inflated by the inertia threshold), a pure-delegation alternative and
    /// the best operator alternative, and returns the winner as a pending
    /// strategy, or `None` to stay put.
    ///
    /// Ties favor current over delegator over operator, so equal-utility
    /// agents do not churn between roles.
    pub fn decide(
        &self,
        view: &SystemView<'_>,
        ids: &mut IdSequence,
    ) -> Result<Option<Strategy>, SimError> {
        let current_utility = self.strategy_utility(&self.strategy, view)?;
        let inflated = ((1.0 + view.relative_utility_threshold) * current_utility)
            .max(current_utility + view.absolute_utility_threshold);

        let mut candidates: Vec<(f64, Option<Strategy>)> = vec![(inflated, None)];

        // Operators sitting on a freshly opened pool are assumed to keep it
        // for a while, so the pure-delegation move is off the table for them.
        if self.cooldown == 0 {
            let delegator = self.delegation_move(self.stake, view)?;
            let utility = self.strategy_utility(&delegator, view)?;
            candidates.push((utility, Some(delegator)));
        }

        let mark = ids.mark();
        let mut operator_index = None;
        if self.strategy.is_pool_operator() || self.has_potential_for_pool(view) {
            let mut best: Option<(f64, Strategy)> = None;
            for candidate in self.operator_moves(view, ids)? {
                let utility = self.strategy_utility(&candidate, view)?;
                // Strictly greater keeps the smallest viable pool count on ties.
                if utility > 0.0 && best.as_ref().map_or(true, |(u, _)| utility > *u) {
                    best = Some((utility, candidate));
                }
            }
            if let Some((utility, strategy)) = best {
                operator_index = Some(candidates.len());
                candidates.push((utility, Some(strategy)));
            }
        }

        let mut winner = 0;
        for i in 1..candidates.len() {
            if candidates[i].0 > candidates[winner].0 {
                winner = i;
            }
        }

        // Ids consumed for hypothetical pools go back to the allocator when
        // the operator branch loses; they were never committed.
        if operator_index != Some(winner) {
            ids.rewind_to(mark);
        }

        Ok(candidates.swap_remove(winner).1)
    }

    /// Total utility of a strategy: operator profit over its owned pools plus
    /// the delegation payoff of its stake allocations. Allocating to a pool
    /// missing from the registry is a hard failure, never silently skipped.
    pub fn strategy_utility(
        &self,
        strategy: &Strategy,
        view: &SystemView<'_>,
    ) -> Result<f64, SimError> {
        let mut utility = 0.0;

        if let Some(owned) = strategy.owned_pools() {
            // Hypothetical pools shadow their committed counterparts while
            // projecting the equilibrium stake.
            let mut all_pools = view.pools.clone();
            for (&id, pool) in owned {
                all_pools.insert(id, pool.clone());
            }
            for pool in owned.values() {
                utility += self.operator_utility(pool, &all_pools, view);
            }
        }

        for (&pool_id, &allocation) in strategy.allocations() {
            if allocation <= 0.0 {
                continue;
            }
            let pool = view.pools.get(&pool_id).ok_or(SimError::InvalidReference {
                agent: self.id,
                pool: pool_id,
            })?;
            utility += self.delegator_utility(pool, allocation, view);
        }
        Ok(utility)
    }

    /// Operator payoff for one pool: profit at the projected stake, scaled by
    /// the margin factor (full capture at margin 1, pro-rata share at margin
    /// 0). A pool running at a loss keeps its raw negative profit; the margin
    /// factor never softens a loss.
    fn operator_utility(
        &self,
        pool: &Pool,
        all_pools: &BTreeMap<PoolId, Pool>,
        view: &SystemView<'_>,
    ) -> f64 {
        let pool_stake = non_myopic_pool_stake(pool.id, all_pools, view.beta, view.k);
        if pool_stake <= 0.0 {
            return 0.0;
        }
        let reward = pool_reward(pool_stake, pool.pledge, view.alpha, view.beta);
        let profit = reward - pool.cost;
        if profit <= 0.0 {
            return profit;
        }
        let share = pool.pledge / pool_stake;
        profit * (pool.margin + (1.0 - pool.margin) * share)
    }

    /// Delegator payoff for allocating stake to a pool: the stake-weighted
    /// share of the pool's profit after the operator's margin, floored at
    /// zero since nobody pays to delegate.
    fn delegator_utility(&self, pool: &Pool, allocation: f64, view: &SystemView<'_>) -> f64 {
        let previous = self
            .strategy
            .allocations()
            .get(&pool.id)
            .copied()
            .unwrap_or(0.0);
        let current_stake = pool.stake - previous + allocation;
        let pool_stake = if self.is_myopic {
            current_stake
        } else {
            non_myopic_pool_stake(pool.id, view.pools, view.beta, view.k).max(current_stake)
        };
        if pool_stake <= 0.0 {
            return 0.0;
        }
        let reward = pool_reward(pool_stake, pool.pledge, view.alpha, view.beta);
        let share = allocation / pool_stake;
        ((1.0 - pool.margin) * share * (reward - pool.cost)).max(0.0)
    }

    /// Whether this agent is in a good spot to open a pool. If the existing
    /// pools cannot absorb the total stake without oversaturating, a positive
    /// potential profit is enough. Otherwise the agent only opens a pool if
    /// its best-case desirability beats at least one incumbent, with the
    /// prospect of stealing that pool's delegators.
    pub fn has_potential_for_pool(&self, view: &SystemView<'_>) -> bool {
        let own_potential = potential_profit(self.stake, self.cost, view.alpha, view.beta);
        if (view.pools.len() as f64) * view.beta < view.total_stake {
            return own_potential > 0.0;
        }
        own_potential > 0.0
            && view
                .pools
                .values()
                .any(|pool| pool.desirability() < own_potential)
    }

    /// Splits the agent's stake evenly across its pools as pledge, capping
    /// each pool at saturation since pledge above beta earns nothing extra.
    fn pledges(&self, num_pools: usize, beta: f64) -> Result<Vec<f64>, SimError> {
        if num_pools == 0 {
            return Err(SimError::NonPositiveAllocation(format!(
                "agent {} tried to split pledge across zero pools",
                self.id
            )));
        }
        Ok(vec![(self.stake / num_pools as f64).min(beta); num_pools])
    }

    /// Greedy desirability-ordered delegation: fill the most desirable
    /// public, non-self-owned pools up to saturation until the stake runs
    /// out. Ties in desirability go to the pool with more current stake, as
    /// it pays out sooner.
    fn delegation_move(
        &self,
        stake_to_delegate: f64,
        view: &SystemView<'_>,
    ) -> Result<Strategy, SimError> {
        let mut pools = view.pools.clone();
        // Withdraw this agent's own current delegations before measuring room.
        for (&pool_id, &allocation) in self.strategy.allocations() {
            if allocation > 0.0 {
                let pool = pools.get_mut(&pool_id).ok_or(SimError::InvalidReference {
                    agent: self.id,
                    pool: pool_id,
                })?;
                pool.update_delegation(-allocation, self.id)?;
            }
        }

        let mut candidates: Vec<(PoolId, f64, f64)> = pools
            .values()
            .filter(|pool| pool.owner != self.id && !pool.is_private)
            .map(|pool| {
                let desirability = if self.is_myopic {
                    pool.myopic_desirability(view.alpha, view.beta)
                } else {
                    pool.desirability()
                };
                (pool.id, desirability, pool.stake)
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.0.cmp(&b.0))
        });

        let mut remaining = stake_to_delegate;
        let mut allocations = BTreeMap::new();
        for (pool_id, _, stake) in candidates {
            if remaining <= 0.0 {
                break;
            }
            if stake < view.beta {
                let allocation = remaining.min(view.beta - stake);
                if allocation > 0.0 {
                    remaining -= allocation;
                    allocations.insert(pool_id, allocation);
                }
            }
        }
        Ok(Strategy::delegator(allocations))
    }

    /// The candidate pool counts an operator considers: always one pool, and
    /// with pool splitting enabled also the current count and its neighbors.
    /// A decrease is forbidden while a recently opened pool is in cooldown.
    fn operator_moves(
        &self,
        view: &SystemView<'_>,
        ids: &mut IdSequence,
    ) -> Result<Vec<Strategy>, SimError> {
        let current_num = self.strategy.num_pools();
        let mut options = BTreeSet::from([1usize]);
        if view.pool_splitting {
            if current_num > 0 {
                options.insert(current_num);
                if current_num > 1 {
                    if self.cooldown > 0 {
                        options.remove(&1);
                    } else {
                        options.insert(current_num - 1);
                    }
                }
            }
            options.insert(current_num + 1);
        }

        let mut moves = Vec::with_capacity(options.len());
        for &num_pools in &options {
            let kept = self.retained_pools(num_pools);
            moves.push(self.operator_move(num_pools, kept, view, ids)?);
        }
        Ok(moves)
    }

    /// When shrinking, retire the worst-ranked owned pools. Ranking goes
    /// through the shared rank function so retirement follows the same
    /// tie-breaking as every other ranking decision.
    fn retained_pools(&self, num_pools: usize) -> BTreeMap<PoolId, Pool> {
        let mut owned = self
            .strategy
            .owned_pools()
            .cloned()
            .unwrap_or_default();
        while owned.len() > num_pools {
            let desirabilities: BTreeMap<PoolId, f64> =
                owned.iter().map(|(&id, p)| (id, p.desirability())).collect();
            let potential_profits: BTreeMap<PoolId, f64> = owned
                .iter()
                .map(|(&id, p)| (id, p.potential_profit))
                .collect();
            let ranks = rank_descending(&desirabilities, &potential_profits);
            let worst = ranks
                .iter()
                .max_by_key(|&(_, &rank)| rank)
                .map(|(&id, _)| id);
            match worst {
                Some(id) => owned.remove(&id),
                None => break,
            };
        }
        owned
    }

    /// Builds a full operator strategy for a given pool count: reshape the
    /// surviving pools to the new pledge, open the missing ones with fresh
    /// ids, pick margins, then delegate whatever stake is left over with the
    /// same greedy rule delegators use.
    fn operator_move(
        &self,
        num_pools: usize,
        mut owned: BTreeMap<PoolId, Pool>,
        view: &SystemView<'_>,
        ids: &mut IdSequence,
    ) -> Result<Strategy, SimError> {
        let pledges = self.pledges(num_pools, view.beta)?;
        let mut margins = Vec::with_capacity(num_pools);
        // The shared infrastructure cost only kicks in when running more than
        // one pool.
        let cost_per_pool = if num_pools > 1 {
            view.common_cost + self.cost / num_pools as f64
        } else {
            self.cost
        };

        for (i, pool) in owned.values_mut().enumerate() {
            pool.stake -= pool.pledge - pledges[i];
            pool.pledge = pledges[i];
            pool.is_private = pool.pledge >= view.beta;
            pool.cost = cost_per_pool;
            pool.set_potential_profit(view.alpha, view.beta);
            pool.margin = if pool.is_private {
                0.0
            } else {
                self.choose_margin(pool, pool.margin, view)
            };
            margins.push(pool.margin);
        }

        let existing = owned.len();
        for &pledge in pledges.iter().take(num_pools).skip(existing) {
            let pool_id = ids.next_id();
            let mut pool = Pool::new(
                pool_id,
                self.id,
                pledge,
                0.0,
                cost_per_pool,
                view.alpha,
                view.beta,
            );
            if !pool.is_private {
                pool.margin = self.choose_margin(&pool, STARTING_MARGIN, view);
            }
            margins.push(pool.margin);
            owned.insert(pool_id, pool);
        }

        let remaining = self.stake - pledges.iter().sum::<f64>();
        let allocations = if remaining > 0.0 {
            self.delegation_move(remaining, view)?.allocations().clone()
        } else {
            BTreeMap::new()
        };

        Ok(Strategy::Operator {
            pledges,
            margins,
            allocations,
            owned_pools: owned,
        })
    }

    fn choose_margin(&self, pool: &Pool, initial_margin: f64, view: &SystemView<'_>) -> f64 {
        match view.margin_rule {
            MarginRule::BinarySearch => self.binary_search_margin(pool, initial_margin, view),
            MarginRule::PerfectStrategy => self.perfect_margin(view),
        }
    }

    /// Fixed-depth bisection over [0, min(2 * initial, 1)] maximizing the
    /// operator's utility for this pool against a scratch copy of the
    /// registry. Deterministic and fast, not a global optimum.
    fn binary_search_margin(
        &self,
        pool: &Pool,
        initial_margin: f64,
        view: &SystemView<'_>,
    ) -> f64 {
        let mut scratch = view.pools.clone();
        let mut probe = pool.clone();

        let mut lower = 0.0_f64;
        let mut mid = initial_margin;
        let mut upper = (2.0 * mid).min(1.0);

        probe.margin = mid;
        scratch.insert(probe.id, probe.clone());
        let mut mid_utility = self.operator_utility(&probe, &scratch, view);

        for _ in 0..MARGIN_SEARCH_DEPTH {
            let candidate = (lower + mid) / 2.0;
            probe.margin = candidate;
            scratch.insert(probe.id, probe.clone());
            let candidate_utility = self.operator_utility(&probe, &scratch, view);
            if candidate_utility >= mid_utility {
                upper = mid;
            } else {
                lower = mid;
            }
            mid = (lower + upper) / 2.0;
            probe.margin = mid;
            scratch.insert(probe.id, probe.clone());
            mid_utility = self.operator_utility(&probe, &scratch, view);
        }
        mid
    }

    /// Margin from the potential-profit ranking of all agents: an agent
    /// ranked within the top k charges exactly the edge it holds over the
    /// (k+1)-ranked agent; everyone else charges nothing.
    fn perfect_margin(&self, view: &SystemView<'_>) -> f64 {
        let potential_profits: BTreeMap<PoolId, f64> = view
            .profiles
            .iter()
            .enumerate()
            .map(|(id, profile)| {
                (
                    id as PoolId,
                    potential_profit(profile.stake, profile.cost, view.alpha, view.beta),
                )
            })
            .collect();
        let ranks = rank_descending(&potential_profits, &BTreeMap::new());

        let own_rank = ranks[&(self.id as PoolId)];
        if own_rank > view.k {
            return 0.0;
        }
        let n = view.profiles.len();
        let reference = if view.k < n {
            ranks
                .iter()
                .find(|&(_, &rank)| rank == view.k + 1)
                .and_then(|(id, _)| potential_profits.get(id).copied())
                .unwrap_or(0.0)
        } else {
            0.0
        };
        let own = potential_profits[&(self.id as PoolId)];
        if own <= 0.0 {
            return 0.0;
        }
        (1.0 - reference / own).max(0.0)
    }
}

// -----------------------------------------------------------------------------
//  Unit Tests
// -----------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    const ALPHA: f64 = 0.3;

    fn profile(stake: f64, cost: f64) -> AgentProfile {
        AgentProfile {
            stake,
            cost,
            is_myopic: false,
            abstains: false,
        }
    }

    fn view_over<'a>(
        pools: &'a BTreeMap<PoolId, Pool>,
        profiles: &'a [AgentProfile],
        beta: f64,
        k: usize,
        total_stake: f64,
    ) -> SystemView<'a> {
        SystemView {
            pools,
            profiles,
            alpha: ALPHA,
            beta,
            k,
            total_stake,
            common_cost: 0.0,
            relative_utility_threshold: 0.0,
            absolute_utility_threshold: 1e-9,
            pool_splitting: false,
            margin_rule: MarginRule::BinarySearch,
        }
    }

    fn pool_with(
        id: PoolId,
        owner: AgentId,
        pledge: f64,
        margin: f64,
        stake: f64,
        beta: f64,
    ) -> Pool {
        let mut pool = Pool::new(id, owner, pledge, margin, 0.0, ALPHA, beta);
        pool.stake = stake;
        pool
    }

    #[test]
    fn test_no_pool_potential_when_unprofitable() {
        // Arrange: the agent's cost exceeds any achievable reward.
        let pools = BTreeMap::new();
        let profiles = [profile(1.0, 100.0)];
        let view = view_over(&pools, &profiles, 5.0, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        // Act + Assert
        assert!(!agent.has_potential_for_pool(&view));
    }

    #[test]
    fn test_unprofitable_agent_never_opens_pool() {
        let pools = BTreeMap::new();
        let profiles = [profile(1.0, 100.0)];
        let view = view_over(&pools, &profiles, 5.0, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);
        let mut ids = IdSequence::new();

        let pending = agent.decide(&view, &mut ids).unwrap();

        assert!(pending.is_none());
        assert_eq!(ids.mark(), 0, "no hypothetical ids may leak");
    }

    #[test]
    fn test_pool_potential_under_capacity_shortage() {
        // One pool at beta cannot cover a total stake of 10.
        let beta = 5.0;
        let pools = BTreeMap::from([(1, pool_with(1, 1, 1.0, 0.0, 5.0, beta))]);
        let profiles = [profile(1.0, 0.0), profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        assert!(agent.has_potential_for_pool(&view));
    }

    #[test]
    fn test_pool_potential_by_stealing_from_weak_incumbent() {
        let beta = 5.0;
        // Two pools cover the stake, but one has a fat margin.
        let pools = BTreeMap::from([
            (1, pool_with(1, 1, 1.0, 0.0, 5.0, beta)),
            (2, pool_with(2, 2, 1.0, 0.9, 5.0, beta)),
        ]);
        let profiles = [profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        assert!(agent.has_potential_for_pool(&view));
    }

    #[test]
    fn test_no_pool_potential_against_equal_incumbents() {
        let beta = 5.0;
        let pools = BTreeMap::from([
            (1, pool_with(1, 1, 1.0, 0.0, 5.0, beta)),
            (2, pool_with(2, 2, 1.0, 0.0, 5.0, beta)),
        ]);
        let profiles = [profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        assert!(!agent.has_potential_for_pool(&view));
    }

    #[test]
    fn test_greedy_delegation_fills_most_desirable_first() {
        // Arrange: pool 2 has the lower margin, so it should fill first.
        let beta = 5.0;
        let pools = BTreeMap::from([
            (1, pool_with(1, 1, 1.0, 0.2, 1.0, beta)),
            (2, pool_with(2, 2, 1.0, 0.0, 4.0, beta)),
        ]);
        let profiles = [profile(3.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        // Act
        let strategy = agent.delegation_move(3.0, &view).unwrap();

        // Assert: 1.0 fits into pool 2 before saturation, the remaining 2.0
        // spills into pool 1.
        let allocations = strategy.allocations();
        assert_eq!(allocations.get(&2), Some(&1.0));
        assert_eq!(allocations.get(&1), Some(&2.0));
    }

    #[test]
    fn test_greedy_delegation_skips_private_and_own_pools() {
        let beta = 5.0;
        let mut private_pool = pool_with(1, 1, 5.0, 0.0, 5.0, beta);
        private_pool.is_private = true;
        let own_pool = pool_with(2, 0, 1.0, 0.0, 1.0, beta);
        let open_pool = pool_with(3, 2, 1.0, 0.1, 1.0, beta);
        let pools = BTreeMap::from([(1, private_pool), (2, own_pool), (3, open_pool)]);
        let profiles = [profile(2.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        let strategy = agent.delegation_move(2.0, &view).unwrap();

        assert_eq!(strategy.allocations().len(), 1);
        assert_eq!(strategy.allocations().get(&3), Some(&2.0));
    }

    #[test]
    fn test_greedy_delegation_breaks_desirability_ties_by_stake() {
        let beta = 5.0;
        let pools = BTreeMap::from([
            (1, pool_with(1, 1, 1.0, 0.0, 1.0, beta)),
            (2, pool_with(2, 2, 1.0, 0.0, 4.0, beta)),
        ]);
        let profiles = [profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        let strategy = agent.delegation_move(1.0, &view).unwrap();

        // Same desirability, pool 2 has more stake and wins the allocation.
        assert_eq!(strategy.allocations().get(&2), Some(&1.0));
        assert!(!strategy.allocations().contains_key(&1));
    }

    #[test]
    fn test_pledges_split_evenly_and_cap_at_saturation() {
        let profiles = [profile(8.0, 0.0)];
        let agent = Stakeholder::new(0, &profiles[0]);

        assert_eq!(agent.pledges(2, 5.0).unwrap(), vec![4.0, 4.0]);
        // A whale splitting into two pools still caps each pledge at beta.
        assert_eq!(agent.pledges(1, 5.0).unwrap(), vec![5.0]);
    }

    #[test]
    fn test_pledges_reject_zero_pool_count() {
        let profiles = [profile(8.0, 0.0)];
        let agent = Stakeholder::new(0, &profiles[0]);
        assert!(matches!(
            agent.pledges(0, 5.0),
            Err(SimError::NonPositiveAllocation(_))
        ));
    }

    #[test]
    fn test_binary_search_margin_stays_in_bounds() {
        let beta = 5.0;
        let pools = BTreeMap::new();
        let profiles = [profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);
        let pool = pool_with(1, 0, 1.0, 0.0, 1.0, beta);

        let margin = agent.binary_search_margin(&pool, STARTING_MARGIN, &view);

        assert!((0.0..=1.0).contains(&margin));
        assert!(margin <= 2.0 * STARTING_MARGIN);
    }

    #[test]
    fn test_perfect_margin_zero_for_equal_agents() {
        // All agents have identical potential profit, so nobody holds an
        // edge and every margin collapses to zero.
        let pools = BTreeMap::new();
        let profiles = vec![profile(1.0, 0.0); 4];
        let view = view_over(&pools, &profiles, 5.0, 2, 4.0);

        for id in 0..4 {
            let agent = Stakeholder::new(id, &profiles[id]);
            assert_eq!(agent.perfect_margin(&view), 0.0);
        }
    }

    #[test]
    fn test_perfect_margin_reflects_profit_edge() {
        let pools = BTreeMap::new();
        // Agent 0 is strictly more cost-efficient than the rest.
        let profiles = vec![
            profile(1.0, 0.0),
            profile(1.0, 0.3),
            profile(1.0, 0.3),
            profile(1.0, 0.3),
        ];
        let view = view_over(&pools, &profiles, 5.0, 1, 4.0);
        let leader = Stakeholder::new(0, &profiles[0]);
        let trailer = Stakeholder::new(1, &profiles[1]);

        let leader_margin = leader.perfect_margin(&view);
        let trailer_margin = trailer.perfect_margin(&view);

        assert!(leader_margin > 0.0);
        assert_eq!(trailer_margin, 0.0);
    }

    #[test]
    fn test_strategy_utility_rejects_unknown_pool() {
        let pools = BTreeMap::new();
        let profiles = [profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, 5.0, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);
        let strategy = Strategy::delegator(BTreeMap::from([(99, 1.0)]));

        let result = agent.strategy_utility(&strategy, &view);

        assert_eq!(
            result,
            Err(SimError::InvalidReference { agent: 0, pool: 99 })
        );
    }

    #[test]
    fn test_operator_at_loss_keeps_raw_negative_utility() {
        let beta = 5.0;
        let mut pool = Pool::new(1, 0, 1.0, 0.9, 10.0, ALPHA, beta);
        pool.set_potential_profit(ALPHA, beta);
        let pools = BTreeMap::from([(1, pool.clone())]);
        let profiles = [profile(1.0, 10.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);

        let utility = agent.operator_utility(&pool, &pools, &view);

        // Loss comes through undiluted; the margin factor must not shrink it.
        assert!(utility < 0.0);
        let reward = pool_reward(beta, 1.0, ALPHA, beta);
        assert_eq!(utility, reward - 10.0);
    }

    #[test]
    fn test_retained_pools_retires_worst_ranked() {
        let beta = 5.0;
        let keeper = pool_with(1, 0, 2.0, 0.0, 4.0, beta);
        let loser = pool_with(2, 0, 2.0, 0.5, 2.0, beta);
        let profiles = [profile(4.0, 0.0)];
        let mut agent = Stakeholder::new(0, &profiles[0]);
        agent.strategy = Strategy::Operator {
            pledges: vec![2.0, 2.0],
            margins: vec![0.0, 0.5],
            allocations: BTreeMap::new(),
            owned_pools: BTreeMap::from([(1, keeper), (2, loser)]),
        };

        let kept = agent.retained_pools(1);

        assert_eq!(kept.len(), 1);
        assert!(kept.contains_key(&1), "the low-margin pool survives");
    }

    #[test]
    fn test_decide_prefers_delegation_over_marginal_pool() {
        // Arrange: two saturated zero-margin incumbents leave no edge for a
        // third pool, but pool 2 has spare room to delegate into.
        let beta = 5.0;
        let pools = BTreeMap::from([
            (1, pool_with(1, 1, 1.0, 0.0, 5.0, beta)),
            (2, pool_with(2, 2, 1.0, 0.0, 4.0, beta)),
        ]);
        let profiles = [profile(1.0, 0.0), profile(1.0, 0.0), profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let agent = Stakeholder::new(0, &profiles[0]);
        let mut ids = IdSequence::new();

        // Act
        let pending = agent.decide(&view, &mut ids).unwrap();

        // Assert
        let strategy = pending.expect("an idle agent with free stake moves");
        assert!(!strategy.is_pool_operator());
        assert_eq!(strategy.allocations().get(&2), Some(&1.0));
    }

    #[test]
    fn test_decide_in_cooldown_skips_delegation_branch() {
        let beta = 5.0;
        let own_pool = pool_with(1, 0, 1.0, 0.0, 1.0, beta);
        let rival = pool_with(2, 1, 1.0, 0.0, 4.0, beta);
        let pools = BTreeMap::from([(1, own_pool.clone()), (2, rival)]);
        let profiles = [profile(1.0, 0.0), profile(1.0, 0.0)];
        let view = view_over(&pools, &profiles, beta, 2, 10.0);
        let mut agent = Stakeholder::new(0, &profiles[0]);
        agent.strategy = Strategy::Operator {
            pledges: vec![1.0],
            margins: vec![0.0],
            allocations: BTreeMap::new(),
            owned_pools: BTreeMap::from([(1, own_pool)]),
        };
        agent.cooldown = 3;
        let mut ids = IdSequence::new();
        ids.rewind_to(2);

        let pending = agent.decide(&view, &mut ids).unwrap();

        // The agent may re-shape its pool but must not abandon it.
        if let Some(strategy) = pending {
            assert!(strategy.is_pool_operator());
        }
    }
}
