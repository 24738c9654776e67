// src/setup.rs

//! Seeded generators for initial agent populations. Stake follows a Pareto
//! distribution by default (a few whales, a long tail of small holders);
//! costs are drawn uniformly from a band.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Pareto;

use crate::agents::stakeholder::AgentProfile;
use crate::error::SimError;

/// Draws `n` stake values from a Pareto distribution with the given shape.
/// When `normalize_to` is set the draws are rescaled so they sum to it,
/// keeping the relative inequality of the raw sample.
pub fn stake_distr_pareto(
    n: usize,
    shape: f64,
    normalize_to: Option<f64>,
    seed: u64,
) -> Result<Vec<f64>, SimError> {
    if n == 0 {
        return Err(SimError::InvalidParameter(
            "population size must be positive".into(),
        ));
    }
    let pareto = Pareto::new(1.0, shape)
        .map_err(|e| SimError::InvalidParameter(format!("bad pareto shape {}: {}", shape, e)))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut stakes: Vec<f64> = (0..n).map(|_| pareto.sample(&mut rng)).collect();
    if let Some(total) = normalize_to {
        if total <= 0.0 {
            return Err(SimError::InvalidParameter(
                "normalization target must be positive".into(),
            ));
        }
        let sum: f64 = stakes.iter().sum();
        for stake in &mut stakes {
            *stake *= total / sum;
        }
    }
    Ok(stakes)
}

/// Equal stake for everyone, summing to `total`.
pub fn stake_distr_flat(n: usize, total: f64) -> Result<Vec<f64>, SimError> {
    if n == 0 {
        return Err(SimError::InvalidParameter(
            "population size must be positive".into(),
        ));
    }
    if total <= 0.0 {
        return Err(SimError::InvalidParameter(
            "total stake must be positive".into(),
        ));
    }
    Ok(vec![total / n as f64; n])
}

/// Uniform per-agent operating costs on [low, high].
pub fn cost_distr_uniform(n: usize, low: f64, high: f64, seed: u64) -> Result<Vec<f64>, SimError> {
    if low < 0.0 || high < low {
        return Err(SimError::InvalidParameter(format!(
            "invalid cost band [{}, {}]",
            low, high
        )));
    }
    let uniform = Uniform::new_inclusive(low, high);
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..n).map(|_| uniform.sample(&mut rng)).collect())
}

/// Zips stake and cost samples into agent profiles.
pub fn agent_profiles(stakes: &[f64], costs: &[f64]) -> Result<Vec<AgentProfile>, SimError> {
    if stakes.len() != costs.len() {
        return Err(SimError::InvalidParameter(format!(
            "{} stakes but {} costs",
            stakes.len(),
            costs.len()
        )));
    }
    Ok(stakes
        .iter()
        .zip(costs)
        .map(|(&stake, &cost)| AgentProfile {
            stake,
            cost,
            is_myopic: false,
            abstains: false,
        })
        .collect())
}
