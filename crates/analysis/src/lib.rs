//! Scenario analysis over the recalculation engine.
//!
//! Every analysis here drives `finvision-engine` the same way: clone the
//! base model, apply one set of edits, recalculate, observe the target. No
//! run shares mutable state with another, so a failed slice never poisons
//! the rest of a sweep.

use rustc_hash::FxHashMap;

use finvision_engine::cell::{CellRef, Value};
use finvision_engine::model::Model;
use finvision_engine::recalc::{RecalcEngine, RecalcResult};

pub mod monte_carlo;
pub mod sensitivity;
pub mod tornado;

pub use monte_carlo::{
    monte_carlo, MonteCarloConfig, MonteCarloError, MonteCarloInput, MonteCarloResult,
    ParameterDistribution,
};
pub use sensitivity::{
    impact_analysis, sensitivity_result, CellSwing, ImpactAnalysis, ImpactStep, ImpactSummary,
    SensitivityResult,
};
pub use tornado::{
    spider_analysis, tornado_analysis, SpiderPoint, SpiderSeries, TornadoAnalysis, TornadoBar,
};

/// Run one isolated recalculation: clone the base model, apply the edits,
/// recompute. The graph cache in `engine` is shared across runs (the
/// structure never changes within an analysis), the cell state is not.
pub(crate) fn isolated_run(
    engine: &mut RecalcEngine,
    base: &Model,
    edits: FxHashMap<CellRef, Value>,
) -> (Model, RecalcResult) {
    let mut scratch = base.clone();
    let result = engine.recalculate(&mut scratch, &edits);
    (scratch, result)
}

/// Read a numeric target value out of a recalculated model.
pub(crate) fn target_number(model: &Model, target: &CellRef) -> Option<f64> {
    model
        .value(target)
        .and_then(|v| v.to_number().ok())
        .filter(|n| n.is_finite())
}
