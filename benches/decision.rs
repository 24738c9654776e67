// benches/decision.rs

//! Benchmarks the strategy search, the hot loop of every round.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pool_simulator::setup::{agent_profiles, cost_distr_uniform, stake_distr_pareto};
use pool_simulator::{
    AgentProfile, IdSequence, MarginRule, Pool, PoolId, Stakeholder, SystemView,
};

const K: usize = 10;
const ALPHA: f64 = 0.3;

fn population(n: usize) -> Vec<AgentProfile> {
    let stakes = stake_distr_pareto(n, 2.0, Some(1.0), 42).unwrap();
    let costs = cost_distr_uniform(n, 0.001, 0.002, 43).unwrap();
    agent_profiles(&stakes, &costs).unwrap()
}

/// A registry with k pools already open, owned by the k largest holders.
fn registry(profiles: &[AgentProfile], beta: f64) -> BTreeMap<PoolId, Pool> {
    let mut by_stake: Vec<(usize, f64)> = profiles
        .iter()
        .enumerate()
        .map(|(id, p)| (id, p.stake))
        .collect();
    by_stake.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut pools = BTreeMap::new();
    for (rank, &(owner, stake)) in by_stake.iter().take(K).enumerate() {
        let id = (rank + 1) as PoolId;
        pools.insert(
            id,
            Pool::new(id, owner, stake, 0.1, profiles[owner].cost, ALPHA, beta),
        );
    }
    pools
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide");
    for &n in &[100usize, 500] {
        let profiles = population(n);
        let beta = 1.0 / K as f64;
        let pools = registry(&profiles, beta);
        // A mid-size holder that is neither an operator nor saturating a pool.
        let agent_id = n / 2;
        let agent = Stakeholder::new(agent_id, &profiles[agent_id]);

        group.bench_function(format!("{}_agents", n), |b| {
            b.iter(|| {
                // Start the id sequence past the pre-built registry.
                let mut ids = IdSequence::new();
                ids.rewind_to(K as PoolId);
                let view = SystemView {
                    pools: &pools,
                    profiles: &profiles,
                    alpha: ALPHA,
                    beta,
                    k: K,
                    total_stake: 1.0,
                    common_cost: 0.0,
                    relative_utility_threshold: 0.0,
                    absolute_utility_threshold: 1e-9,
                    pool_splitting: true,
                    margin_rule: MarginRule::BinarySearch,
                };
                black_box(agent.decide(&view, &mut ids).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decide);
criterion_main!(benches);
