// src/simulation.rs

//! The round-based engine. It owns the world state (the pool registry and
//! the agents), drives one activation per agent per round, and watches for
//! convergence and era transitions.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::agents::config::{
    DEFAULT_ABSOLUTE_UTILITY_THRESHOLD, DEFAULT_COOLDOWN_ROUNDS, DEFAULT_MAX_ROUNDS,
    DEFAULT_RELATIVE_UTILITY_THRESHOLD, DEFAULT_REVISION_INTERVAL,
    DEFAULT_ROUNDS_FOR_CONVERGENCE,
};
use crate::agents::stakeholder::{AgentProfile, IdSequence, MarginRule, Stakeholder, SystemView};
use crate::error::SimError;
use crate::types::{AgentId, Pool, PoolId};

/// How agents take their turns within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivationPolicy {
    /// Fixed agent order, commits apply immediately.
    Sequential,
    /// Order reshuffled every round from the engine's seeded RNG.
    Random,
    /// Every agent decides against the start-of-round state, then all
    /// commits apply in agent order.
    Simultaneous,
}

/// Parameter overrides applied when the system converges and moves into the
/// next era. Fields left as `None` carry over unchanged; an override with no
/// field set advances the era without recording a pivot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EraOverride {
    pub k: Option<usize>,
    pub alpha: Option<f64>,
    pub relative_utility_threshold: Option<f64>,
    pub absolute_utility_threshold: Option<f64>,
    pub cooldown_rounds: Option<u32>,
    pub pool_splitting: Option<bool>,
}

impl EraOverride {
    fn changes_anything(&self) -> bool {
        self.k.is_some()
            || self.alpha.is_some()
            || self.relative_utility_threshold.is_some()
            || self.absolute_utility_threshold.is_some()
            || self.cooldown_rounds.is_some()
            || self.pool_splitting.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationConfig {
    /// Target number of pools; beta = total_stake / k.
    pub k: usize,
    /// Pledge influence on rewards.
    pub alpha: f64,
    pub relative_utility_threshold: f64,
    pub absolute_utility_threshold: f64,
    /// Rounds a freshly opened pool must be kept.
    pub cooldown_rounds: u32,
    /// Requested idle streak for convergence; the engine enforces at least
    /// cooldown_rounds + 1 so a new pool survives one full cooldown window.
    pub rounds_for_convergence: u64,
    pub pool_splitting: bool,
    /// Extra per-pool cost borne by operators running more than one pool.
    pub common_cost: f64,
    pub max_rounds: u64,
    /// How often perceived active stake (and with it k) is revised.
    pub revision_interval: u64,
    pub activation: ActivationPolicy,
    pub margin_rule: MarginRule,
    /// Overrides for eras after the first, entered one per convergence.
    pub eras: Vec<EraOverride>,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            k: 100,
            alpha: 0.3,
            relative_utility_threshold: DEFAULT_RELATIVE_UTILITY_THRESHOLD,
            absolute_utility_threshold: DEFAULT_ABSOLUTE_UTILITY_THRESHOLD,
            cooldown_rounds: DEFAULT_COOLDOWN_ROUNDS,
            rounds_for_convergence: DEFAULT_ROUNDS_FOR_CONVERGENCE,
            pool_splitting: true,
            common_cost: 0.0,
            max_rounds: DEFAULT_MAX_ROUNDS,
            revision_interval: DEFAULT_REVISION_INTERVAL,
            activation: ActivationPolicy::Random,
            margin_rule: MarginRule::BinarySearch,
            eras: Vec::new(),
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Running,
    Finished,
}

/// One row of per-round metrics, kept in memory for external reporters.
#[derive(Debug, Clone, Serialize)]
pub struct RoundMetrics {
    pub round: u64,
    pub num_pools: usize,
    pub delegated_stake: f64,
    pub idle: bool,
}

pub struct Simulation {
    round: u64,
    phase: Phase,
    pools: BTreeMap<PoolId, Pool>,
    agents: Vec<Stakeholder>,
    profiles: Vec<AgentProfile>,
    ids: IdSequence,

    total_stake: f64,
    perceived_active_stake: f64,
    k: usize,
    alpha: f64,
    beta: f64,

    relative_utility_threshold: f64,
    absolute_utility_threshold: f64,
    cooldown_rounds: u32,
    rounds_for_convergence: u64,
    min_idle_rounds: u64,
    pool_splitting: bool,
    common_cost: f64,
    margin_rule: MarginRule,
    activation: ActivationPolicy,
    max_rounds: u64,
    revision_interval: u64,

    consecutive_idle_rounds: u64,
    round_idle: bool,
    era: usize,
    eras: Vec<EraOverride>,
    equilibrium_rounds: Vec<u64>,
    pivot_rounds: Vec<u64>,
    history: Vec<RoundMetrics>,
    rng: StdRng,
}

impl Simulation {
    /// Builds a simulation from per-agent profiles and global parameters.
    /// All validation happens here; a simulation that constructs is safe to
    /// run.
    pub fn new(profiles: Vec<AgentProfile>, config: SimulationConfig) -> Result<Self, SimError> {
        if profiles.is_empty() {
            return Err(SimError::InvalidParameter(
                "at least one agent is required".into(),
            ));
        }
        if config.k == 0 {
            return Err(SimError::InvalidParameter("k must be positive".into()));
        }
        if config.alpha < 0.0 {
            return Err(SimError::InvalidParameter(
                "alpha must be non-negative".into(),
            ));
        }
        if config.relative_utility_threshold < 0.0 || config.absolute_utility_threshold < 0.0 {
            return Err(SimError::InvalidParameter(
                "utility thresholds must be non-negative".into(),
            ));
        }
        if config.revision_interval == 0 {
            return Err(SimError::InvalidParameter(
                "revision interval must be positive".into(),
            ));
        }
        for (i, profile) in profiles.iter().enumerate() {
            if profile.stake < 0.0 || profile.cost < 0.0 {
                return Err(SimError::InvalidParameter(format!(
                    "agent {} has negative stake or cost",
                    i
                )));
            }
        }
        for override_ in &config.eras {
            if override_.k == Some(0) {
                return Err(SimError::InvalidParameter(format!(
                    "era override {:?} sets k to zero",
                    override_
                )));
            }
            let negative = override_.alpha.is_some_and(|a| a < 0.0)
                || override_.relative_utility_threshold.is_some_and(|t| t < 0.0)
                || override_.absolute_utility_threshold.is_some_and(|t| t < 0.0);
            if negative {
                return Err(SimError::InvalidParameter(format!(
                    "era override {:?} has a negative parameter",
                    override_
                )));
            }
        }

        let total_stake: f64 = profiles.iter().map(|p| p.stake).sum();
        if total_stake <= 0.0 {
            return Err(SimError::InvalidParameter(
                "total stake must be positive".into(),
            ));
        }
        let beta = total_stake / config.k as f64;

        let agents = profiles
            .iter()
            .enumerate()
            .map(|(id, profile)| Stakeholder::new(id, profile))
            .collect();

        Ok(Self {
            round: 0,
            phase: Phase::Running,
            pools: BTreeMap::new(),
            agents,
            profiles,
            ids: IdSequence::new(),
            total_stake,
            perceived_active_stake: total_stake,
            k: config.k,
            alpha: config.alpha,
            beta,
            relative_utility_threshold: config.relative_utility_threshold,
            absolute_utility_threshold: config.absolute_utility_threshold,
            cooldown_rounds: config.cooldown_rounds,
            rounds_for_convergence: config.rounds_for_convergence,
            // A recently opened pool gets at least one full cooldown window
            // to prove stable before convergence can be declared.
            min_idle_rounds: (config.cooldown_rounds as u64 + 1)
                .max(config.rounds_for_convergence),
            pool_splitting: config.pool_splitting,
            common_cost: config.common_cost,
            margin_rule: config.margin_rule,
            activation: config.activation,
            max_rounds: config.max_rounds,
            revision_interval: config.revision_interval,
            consecutive_idle_rounds: 0,
            round_idle: true,
            era: 0,
            eras: config.eras,
            equilibrium_rounds: Vec::new(),
            pivot_rounds: Vec::new(),
            history: Vec::new(),
            rng: StdRng::seed_from_u64(config.seed),
        })
    }

    /// Runs rounds until convergence through all eras or the round cap.
    pub fn run(&mut self) -> Result<(), SimError> {
        while self.phase == Phase::Running {
            self.step()?;
        }
        Ok(())
    }

    /// Executes one round of the simulation.
    pub fn step(&mut self) -> Result<(), SimError> {
        if self.phase == Phase::Finished {
            return Ok(());
        }
        if self.round >= self.max_rounds {
            info!(round = self.round, "round cap reached");
            self.phase = Phase::Finished;
            return Ok(());
        }
        if self.round > 0 && self.round % self.revision_interval == 0 {
            self.revise_beliefs();
        }

        self.round_idle = true;
        match self.activation {
            ActivationPolicy::Sequential => {
                let order: Vec<usize> = (0..self.agents.len()).collect();
                self.activate_in_order(&order)?;
            }
            ActivationPolicy::Random => {
                let mut order: Vec<usize> = (0..self.agents.len()).collect();
                order.shuffle(&mut self.rng);
                self.activate_in_order(&order)?;
            }
            ActivationPolicy::Simultaneous => self.activate_simultaneously()?,
        }

        self.history.push(RoundMetrics {
            round: self.round,
            num_pools: self.pools.len(),
            delegated_stake: self.pools.values().map(|p| p.stake).sum(),
            idle: self.round_idle,
        });
        debug!(
            round = self.round,
            pools = self.pools.len(),
            idle = self.round_idle,
            "round complete"
        );

        if self.round_idle {
            self.consecutive_idle_rounds += 1;
            if self.consecutive_idle_rounds >= self.min_idle_rounds {
                let first_idle = self.round + 1 - self.min_idle_rounds;
                self.equilibrium_rounds.push(first_idle);
                info!(round = self.round, era = self.era, "equilibrium reached");
                if self.era < self.eras.len() {
                    self.advance_era();
                } else {
                    self.phase = Phase::Finished;
                }
            }
        } else {
            self.consecutive_idle_rounds = 0;
        }
        self.round += 1;
        Ok(())
    }

    /// Decide-and-commit per agent, in the given order. Each agent sees all
    /// commits made earlier in the round.
    fn activate_in_order(&mut self, order: &[usize]) -> Result<(), SimError> {
        for &idx in order {
            if self.agents[idx].abstains {
                continue;
            }
            let view = SystemView {
                pools: &self.pools,
                profiles: &self.profiles,
                alpha: self.alpha,
                beta: self.beta,
                k: self.k,
                total_stake: self.total_stake,
                common_cost: self.common_cost,
                relative_utility_threshold: self.relative_utility_threshold,
                absolute_utility_threshold: self.absolute_utility_threshold,
                pool_splitting: self.pool_splitting,
                margin_rule: self.margin_rule,
            };
            let pending = self.agents[idx].decide(&view, &mut self.ids)?;
            self.agents[idx].pending = pending;
            if self.commit_agent(idx)? {
                self.round_idle = false;
            }
            let agent = &mut self.agents[idx];
            if agent.cooldown > 0 {
                agent.cooldown -= 1;
            }
        }
        Ok(())
    }

    /// Stage-then-commit: every agent computes its move against the
    /// start-of-round registry, then commits apply strictly in agent order.
    /// A commit closing a pool scrubs that pool from later agents' staged
    /// strategies; beyond that, acting on one-round-stale state is accepted.
    fn activate_simultaneously(&mut self) -> Result<(), SimError> {
        for idx in 0..self.agents.len() {
            if self.agents[idx].abstains {
                continue;
            }
            let view = SystemView {
                pools: &self.pools,
                profiles: &self.profiles,
                alpha: self.alpha,
                beta: self.beta,
                k: self.k,
                total_stake: self.total_stake,
                common_cost: self.common_cost,
                relative_utility_threshold: self.relative_utility_threshold,
                absolute_utility_threshold: self.absolute_utility_threshold,
                pool_splitting: self.pool_splitting,
                margin_rule: self.margin_rule,
            };
            let pending = self.agents[idx].decide(&view, &mut self.ids)?;
            self.agents[idx].pending = pending;
            let agent = &mut self.agents[idx];
            if agent.cooldown > 0 {
                agent.cooldown -= 1;
            }
        }
        for idx in 0..self.agents.len() {
            if self.commit_agent(idx)? {
                self.round_idle = false;
            }
        }
        Ok(())
    }

    /// Applies an agent's pending strategy to the world. Ownership changes
    /// come first (close, reshape, open), delegation deltas last; applying
    /// deltas earlier would mutate pools that are about to disappear.
    /// Returns whether anything was committed.
    pub(crate) fn commit_agent(&mut self, idx: usize) -> Result<bool, SimError> {
        let Some(new_strategy) = self.agents[idx].pending.take() else {
            return Ok(false);
        };
        let agent_id: AgentId = self.agents[idx].id;

        let old_allocations = self.agents[idx].strategy.allocations().clone();
        let new_allocations = new_strategy.allocations().clone();
        let mut deltas: BTreeMap<PoolId, f64> = BTreeMap::new();
        for (&pool_id, &allocation) in &old_allocations {
            deltas.insert(pool_id, -allocation);
        }
        for (&pool_id, &allocation) in &new_allocations {
            *deltas.entry(pool_id).or_insert(0.0) += allocation;
        }

        let old_owned = self.agents[idx].strategy.owned_pool_ids();
        let new_owned = new_strategy.owned_pool_ids();

        for &pool_id in old_owned.difference(&new_owned) {
            self.close_pool(agent_id, pool_id)?;
        }

        if let Some(owned) = new_strategy.owned_pools() {
            for (&pool_id, updated) in owned {
                if !old_owned.contains(&pool_id) {
                    continue;
                }
                let turned_private;
                {
                    let pool = self.pools.get_mut(&pool_id).ok_or(SimError::InvalidReference {
                        agent: agent_id,
                        pool: pool_id,
                    })?;
                    if pool.owner != agent_id {
                        return Err(SimError::InvalidOwnership {
                            agent: agent_id,
                            pool: pool_id,
                            owner: pool.owner,
                        });
                    }
                    pool.margin = updated.margin;
                    let pledge_diff = pool.pledge - updated.pledge;
                    pool.stake -= pledge_diff;
                    pool.pledge = updated.pledge;
                    pool.cost = updated.cost;
                    turned_private = updated.is_private && !pool.is_private;
                    pool.is_private = updated.is_private;
                    pool.set_potential_profit(self.alpha, self.beta);
                }
                if turned_private {
                    // A pool going private sheds all outside delegation.
                    self.remove_delegations(pool_id)?;
                }
            }
        }

        self.agents[idx].strategy = new_strategy;

        for &pool_id in new_owned.difference(&old_owned) {
            let pool = self.agents[idx]
                .strategy
                .owned_pools()
                .and_then(|pools| pools.get(&pool_id))
                .cloned()
                .ok_or(SimError::InvalidReference {
                    agent: agent_id,
                    pool: pool_id,
                })?;
            self.pools.insert(pool_id, pool);
            self.agents[idx].cooldown = self.cooldown_rounds;
            debug!(agent = agent_id, pool = pool_id, "pool opened");
        }

        for (pool_id, delta) in deltas {
            if delta == 0.0 {
                continue;
            }
            let pool = self.pools.get_mut(&pool_id).ok_or(SimError::InvalidReference {
                agent: agent_id,
                pool: pool_id,
            })?;
            pool.update_delegation(delta, agent_id)?;
        }
        Ok(true)
    }

    /// Closes a pool owned by the given agent, undelegating every delegator
    /// first so nobody is left pointing at a dead id.
    fn close_pool(&mut self, agent_id: AgentId, pool_id: PoolId) -> Result<(), SimError> {
        let owner = self
            .pools
            .get(&pool_id)
            .ok_or(SimError::InvalidReference {
                agent: agent_id,
                pool: pool_id,
            })?
            .owner;
        if owner != agent_id {
            return Err(SimError::InvalidOwnership {
                agent: agent_id,
                pool: pool_id,
                owner,
            });
        }
        self.remove_delegations(pool_id)?;
        self.pools.remove(&pool_id);
        debug!(agent = agent_id, pool = pool_id, "pool closed");
        Ok(())
    }

    /// Returns every delegator's stake and drops the pool from their
    /// committed and staged allocations.
    fn remove_delegations(&mut self, pool_id: PoolId) -> Result<(), SimError> {
        let delegators: Vec<(AgentId, f64)> = self
            .pools
            .get(&pool_id)
            .map(|pool| pool.delegators.iter().map(|(&a, &s)| (a, s)).collect())
            .unwrap_or_default();
        for (delegator, amount) in delegators {
            if let Some(pool) = self.pools.get_mut(&pool_id) {
                pool.update_delegation(-amount, delegator)?;
            }
            let agent = &mut self.agents[delegator];
            agent.strategy.allocations_mut().remove(&pool_id);
            if let Some(pending) = agent.pending.as_mut() {
                pending.allocations_mut().remove(&pool_id);
            }
        }
        Ok(())
    }

    /// Belief revision: re-estimate the active stake from what is currently
    /// delegated and adjust the expected pool count k accordingly. The beta
    /// used in reward math deliberately stays pinned to the era's value.
    fn revise_beliefs(&mut self) {
        let active_stake: f64 = self.pools.values().map(|p| p.stake).sum();
        self.perceived_active_stake = active_stake;
        // Pre-round to 12 decimals so float noise cannot bump the ceiling.
        let ratio = (active_stake / self.beta * 1e12).round() / 1e12;
        self.k = ratio.ceil() as usize;
        debug!(k = self.k, active_stake, "beliefs revised");
    }

    /// Applies the next era's overrides and keeps running. Beta is recomputed
    /// with k so the beta = total_stake / k invariant holds after the switch.
    /// A pivot is recorded only when the override actually changes something.
    fn advance_era(&mut self) {
        let override_ = self.eras[self.era];
        self.era += 1;
        if !override_.changes_anything() {
            info!(era = self.era, "era advanced without parameter changes");
            return;
        }
        if let Some(k) = override_.k {
            self.k = k;
            self.beta = self.total_stake / k as f64;
        }
        if let Some(alpha) = override_.alpha {
            self.alpha = alpha;
        }
        if let Some(threshold) = override_.relative_utility_threshold {
            self.relative_utility_threshold = threshold;
        }
        if let Some(threshold) = override_.absolute_utility_threshold {
            self.absolute_utility_threshold = threshold;
        }
        if let Some(cooldown) = override_.cooldown_rounds {
            self.cooldown_rounds = cooldown;
            self.min_idle_rounds = (cooldown as u64 + 1).max(self.rounds_for_convergence);
        }
        if let Some(splitting) = override_.pool_splitting {
            self.pool_splitting = splitting;
        }
        // Cached pool economics are stale under the new parameters.
        for pool in self.pools.values_mut() {
            pool.set_potential_profit(self.alpha, self.beta);
        }
        self.pivot_rounds.push(self.round);
        info!(era = self.era, k = self.k, alpha = self.alpha, "era advanced");
    }

    // --- Read-only observers for external reporters ---

    pub fn pools(&self) -> &BTreeMap<PoolId, Pool> {
        &self.pools
    }

    pub fn agents(&self) -> &[Stakeholder] {
        &self.agents
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn total_stake(&self) -> f64 {
        self.total_stake
    }

    pub fn perceived_active_stake(&self) -> f64 {
        self.perceived_active_stake
    }

    pub fn has_converged(&self) -> bool {
        self.consecutive_idle_rounds >= self.min_idle_rounds
    }

    pub fn consecutive_idle_rounds(&self) -> u64 {
        self.consecutive_idle_rounds
    }

    /// First rounds of the idle streaks that triggered convergence, one per
    /// converged era.
    pub fn equilibrium_rounds(&self) -> &[u64] {
        &self.equilibrium_rounds
    }

    /// Rounds at which era transitions took effect.
    pub fn pivot_rounds(&self) -> &[u64] {
        &self.pivot_rounds
    }

    pub fn history(&self) -> &[RoundMetrics] {
        &self.history
    }
}
