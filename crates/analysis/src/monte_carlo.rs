//! Monte-Carlo simulation.
//!
//! Samples all varying parameters jointly from their declared
//! distributions, runs one isolated recalculation per iteration, and
//! aggregates the distribution of a target cell. Iteration counts are
//! clamped to keep wall-clock cost predictable; a seed makes runs
//! reproducible.

use ordered_float::OrderedFloat;
use rand::distributions::Distribution as _;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Normal, Triangular, Uniform};
use thiserror::Error;

use finvision_engine::cell::{CellRef, Value};
use finvision_engine::model::Model;
use finvision_engine::recalc::RecalcEngine;

use crate::{isolated_run, target_number};

/// Iteration bounds. Below the floor the percentiles are noise; above the
/// ceiling the wall-clock cost stops being interactive.
pub const MIN_ITERATIONS: usize = 100;
pub const MAX_ITERATIONS: usize = 10_000;

/// Sampling distribution for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterDistribution {
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std_dev: f64 },
    Triangular { min: f64, mode: f64, max: f64 },
}

/// One varying parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloInput {
    pub parameter: CellRef,
    pub distribution: ParameterDistribution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    /// Requested iterations; clamped to [MIN_ITERATIONS, MAX_ITERATIONS].
    pub iterations: usize,
    /// Seed for reproducible runs. None draws from entropy.
    pub seed: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            iterations: 1_000,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MonteCarloError {
    #[error("no varying inputs provided")]
    NoInputs,

    #[error("invalid distribution for {parameter}: {message}")]
    InvalidDistribution { parameter: CellRef, message: String },

    #[error("all {0} iterations failed")]
    AllIterationsFailed(usize),
}

/// Aggregated simulation output.
#[derive(Debug, Clone, Serialize)]
pub struct MonteCarloResult {
    pub target: CellRef,
    /// Iterations actually run (after clamping).
    pub iterations: usize,
    /// Iterations whose recalculation failed or produced a non-numeric
    /// target; excluded from the statistics.
    pub failures: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
    /// Sampled target values, sorted ascending; chart-ready.
    pub samples: Vec<f64>,
}

enum Sampler {
    Uniform(Uniform),
    Normal(Normal),
    Triangular(Triangular),
}

impl Sampler {
    fn build(input: &MonteCarloInput) -> Result<Self, MonteCarloError> {
        let invalid = |message: String| MonteCarloError::InvalidDistribution {
            parameter: input.parameter.clone(),
            message,
        };
        match input.distribution {
            ParameterDistribution::Uniform { min, max } => Uniform::new(min, max)
                .map(Sampler::Uniform)
                .map_err(|e| invalid(e.to_string())),
            ParameterDistribution::Normal { mean, std_dev } => Normal::new(mean, std_dev)
                .map(Sampler::Normal)
                .map_err(|e| invalid(e.to_string())),
            ParameterDistribution::Triangular { min, mode, max } => Triangular::new(min, max, mode)
                .map(Sampler::Triangular)
                .map_err(|e| invalid(e.to_string())),
        }
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        match self {
            Sampler::Uniform(d) => d.sample(rng),
            Sampler::Normal(d) => d.sample(rng),
            Sampler::Triangular(d) => d.sample(rng),
        }
    }
}

/// Run the simulation. Each iteration samples every input, recalculates a
/// cloned model, and records `target`. Failed iterations are counted, not
/// fatal; the run only errors when every iteration fails.
pub fn monte_carlo(
    engine: &mut RecalcEngine,
    model: &Model,
    inputs: &[MonteCarloInput],
    target: &CellRef,
    config: &MonteCarloConfig,
) -> Result<MonteCarloResult, MonteCarloError> {
    if inputs.is_empty() {
        return Err(MonteCarloError::NoInputs);
    }
    let samplers: Vec<(CellRef, Sampler)> = inputs
        .iter()
        .map(|input| Sampler::build(input).map(|s| (input.parameter.clone(), s)))
        .collect::<Result<_, _>>()?;

    let iterations = config.iterations.clamp(MIN_ITERATIONS, MAX_ITERATIONS);
    if iterations != config.iterations {
        log::warn!(
            "Monte-Carlo iteration count {} clamped to {}",
            config.iterations,
            iterations
        );
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut samples = Vec::with_capacity(iterations);
    let mut failures = 0usize;
    for _ in 0..iterations {
        let edits: FxHashMap<CellRef, Value> = samplers
            .iter()
            .map(|(reference, sampler)| {
                (reference.clone(), Value::Number(sampler.sample(&mut rng)))
            })
            .collect();
        let (scratch, outcome) = isolated_run(engine, model, edits);
        if !outcome.success {
            failures += 1;
            continue;
        }
        match target_number(&scratch, target) {
            Some(value) => samples.push(value),
            None => failures += 1,
        }
    }

    if samples.is_empty() {
        return Err(MonteCarloError::AllIterationsFailed(iterations));
    }

    samples.sort_unstable_by_key(|v| OrderedFloat(*v));
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = if samples.len() > 1 {
        samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };

    Ok(MonteCarloResult {
        target: target.clone(),
        iterations,
        failures,
        mean,
        std_dev: variance.sqrt(),
        min: samples[0],
        max: *samples.last().expect("samples nonempty"),
        p5: percentile(&samples, 5.0),
        p50: percentile(&samples, 50.0),
        p95: percentile(&samples, 95.0),
        samples,
    })
}

/// Linear-interpolated percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
