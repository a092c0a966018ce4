//! Single-parameter impact sweeps.
//!
//! Sweeps one parameter across a value range, recalculating the model at
//! each step, and reports how every affected cell moves relative to the
//! base case. A failed step is recorded and the sweep continues - the
//! caller sees exactly which parameter values break the model.

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use serde::Serialize;

use finvision_engine::cell::{CellRef, Value};
use finvision_engine::model::Model;
use finvision_engine::recalc::RecalcEngine;

use crate::isolated_run;

/// One slice of the sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ImpactStep {
    pub parameter_value: f64,
    pub success: bool,
    pub error: Option<String>,
    /// Updated values for every affected cell at this step.
    pub cell_values: FxHashMap<CellRef, Value>,
    /// Change versus the base step, in percent. When a cell's base value is
    /// exactly 0 the figure is the raw new value instead of a percentage -
    /// a reporting policy, not a mathematical claim.
    pub percentage_changes: FxHashMap<CellRef, f64>,
}

/// A cell's largest observed swing across the sweep.
#[derive(Debug, Clone, Serialize)]
pub struct CellSwing {
    pub cell: CellRef,
    pub max_abs_change: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpactSummary {
    /// Affected cells ranked by maximum absolute swing, descending. The
    /// swept parameter itself is the driver, not an output, and is
    /// excluded.
    pub most_sensitive: Vec<CellSwing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImpactAnalysis {
    pub parameter: CellRef,
    pub results: Vec<ImpactStep>,
    pub summary: ImpactSummary,
}

/// Sensitivity of one target cell to the swept parameter, fitted across
/// all successful steps.
#[derive(Debug, Clone, Serialize)]
pub struct SensitivityResult {
    pub parameter_reference: CellRef,
    /// Parameter value at the base step.
    pub base_value: f64,
    /// Least-squares slope of target versus parameter.
    pub sensitivity_coefficient: f64,
    /// (min, max) of the target across the sweep.
    pub impact_range: (f64, f64),
    /// Pearson correlation; None when the target never moves.
    pub correlation: Option<f64>,
}

/// Sweep `parameter` across `value_range` in `steps + 1` evenly spaced
/// values (both ends inclusive). Step 0 is the base case; each step is an
/// isolated recalculation of a cloned model.
pub fn impact_analysis(
    engine: &mut RecalcEngine,
    model: &Model,
    parameter: &CellRef,
    value_range: (f64, f64),
    steps: usize,
) -> ImpactAnalysis {
    let (min, max) = value_range;
    let steps = steps.max(1);
    let mut results: Vec<ImpactStep> = Vec::with_capacity(steps + 1);
    // Base values come from the first successful step (normally step 0).
    let mut base_values: Option<FxHashMap<CellRef, f64>> = None;

    for i in 0..=steps {
        let parameter_value = min + (max - min) * i as f64 / steps as f64;
        let mut edits = FxHashMap::default();
        edits.insert(parameter.clone(), Value::Number(parameter_value));
        let (_, outcome) = isolated_run(engine, model, edits);

        if !outcome.success {
            let error = outcome.error.map(|e| format!("{}: {}", e.cell, e.error));
            log::debug!(
                "impact step {}={} failed: {}",
                parameter,
                parameter_value,
                error.as_deref().unwrap_or("recalculation failed")
            );
            results.push(ImpactStep {
                parameter_value,
                success: false,
                error,
                cell_values: FxHashMap::default(),
                percentage_changes: FxHashMap::default(),
            });
            continue;
        }

        let cell_values = outcome.updated_values;
        let numeric: FxHashMap<CellRef, f64> = cell_values
            .iter()
            .filter_map(|(r, v)| v.to_number().ok().map(|n| (r.clone(), n)))
            .collect();

        if base_values.is_none() {
            base_values = Some(numeric.clone());
        }
        let base = base_values.as_ref().expect("base recorded above");

        let mut percentage_changes = FxHashMap::default();
        for (cell, value) in &numeric {
            let Some(base_value) = base.get(cell) else {
                continue;
            };
            let change = if *base_value == 0.0 {
                *value
            } else {
                (value - base_value) / base_value * 100.0
            };
            percentage_changes.insert(cell.clone(), change);
        }

        results.push(ImpactStep {
            parameter_value,
            success: true,
            error: None,
            cell_values,
            percentage_changes,
        });
    }

    let summary = summarize(parameter, &results);
    ImpactAnalysis {
        parameter: parameter.clone(),
        results,
        summary,
    }
}

fn summarize(parameter: &CellRef, results: &[ImpactStep]) -> ImpactSummary {
    let mut swings: FxHashMap<CellRef, f64> = FxHashMap::default();
    for step in results.iter().filter(|s| s.success) {
        for (cell, change) in &step.percentage_changes {
            if cell == parameter {
                continue;
            }
            let entry = swings.entry(cell.clone()).or_insert(0.0);
            *entry = entry.max(change.abs());
        }
    }

    let mut most_sensitive: Vec<CellSwing> = swings
        .into_iter()
        .map(|(cell, max_abs_change)| CellSwing {
            cell,
            max_abs_change,
        })
        .collect();
    most_sensitive.sort_by(|a, b| {
        OrderedFloat(b.max_abs_change)
            .cmp(&OrderedFloat(a.max_abs_change))
            .then_with(|| a.cell.cmp(&b.cell))
    });

    ImpactSummary { most_sensitive }
}

/// Fit a sensitivity coefficient for one target cell from a finished sweep.
/// Needs at least two successful steps with a numeric target.
pub fn sensitivity_result(
    analysis: &ImpactAnalysis,
    target: &CellRef,
) -> Option<SensitivityResult> {
    let points: Vec<(f64, f64)> = analysis
        .results
        .iter()
        .filter(|s| s.success)
        .filter_map(|s| {
            s.cell_values
                .get(target)
                .and_then(|v| v.to_number().ok())
                .map(|y| (s.parameter_value, y))
        })
        .collect();
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in &points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 {
        return None;
    }

    let correlation = if var_y == 0.0 {
        None
    } else {
        Some(cov / (var_x.sqrt() * var_y.sqrt()))
    };
    let min = points.iter().map(|(_, y)| *y).fold(f64::INFINITY, f64::min);
    let max = points
        .iter()
        .map(|(_, y)| *y)
        .fold(f64::NEG_INFINITY, f64::max);

    Some(SensitivityResult {
        parameter_reference: analysis.parameter.clone(),
        base_value: analysis.results.first()?.parameter_value,
        sensitivity_coefficient: cov / var_x,
        impact_range: (min, max),
        correlation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use finvision_engine::cell::Cell;

    fn model(cells: &[(&str, &str)]) -> Model {
        Model::with_cells(
            "analysis-test",
            cells
                .iter()
                .map(|(r, input)| (CellRef::from(*r), Cell::from_input(input))),
        )
    }

    #[test]
    fn test_sweep_has_steps_plus_one_slices_inclusive() {
        let m = model(&[("A1", "1"), ("C1", "=A1*2")]);
        let mut engine = RecalcEngine::new();

        let analysis = impact_analysis(&mut engine, &m, &CellRef::from("A1"), (0.0, 10.0), 10);
        assert_eq!(analysis.results.len(), 11);
        assert_eq!(analysis.results[0].parameter_value, 0.0);
        assert_eq!(analysis.results[10].parameter_value, 10.0);
    }

    #[test]
    fn test_zero_base_policy_and_ranking() {
        // C1 = A1 * 2 with A1 swept from 0: base value is 0, so reported
        // changes are raw values, and C1 is the only ranked cell.
        let m = model(&[("A1", "0"), ("C1", "=A1*2")]);
        let mut engine = RecalcEngine::new();

        let analysis = impact_analysis(&mut engine, &m, &CellRef::from("A1"), (0.0, 10.0), 10);
        let last = analysis.results.last().unwrap();
        assert!(last.success);
        assert_eq!(last.percentage_changes[&CellRef::from("C1")], 20.0);

        let ranked = &analysis.summary.most_sensitive;
        assert_eq!(ranked[0].cell, CellRef::from("C1"));
        assert!(!ranked.iter().any(|s| s.cell == CellRef::from("A1")));
    }

    #[test]
    fn test_percentage_change_relative_to_base_step() {
        let m = model(&[("A1", "1"), ("C1", "=A1*2")]);
        let mut engine = RecalcEngine::new();

        // Sweep 10 -> 20: base C1 = 20, final C1 = 40 = +100%.
        let analysis = impact_analysis(&mut engine, &m, &CellRef::from("A1"), (10.0, 20.0), 2);
        let last = analysis.results.last().unwrap();
        assert!((last.percentage_changes[&CellRef::from("C1")] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_slice_does_not_abort_the_sweep() {
        // D1 = 10/A1 breaks at A1 = 0 but nowhere else.
        let m = model(&[("A1", "1"), ("D1", "=10/A1")]);
        let mut engine = RecalcEngine::new();

        let analysis = impact_analysis(&mut engine, &m, &CellRef::from("A1"), (-1.0, 1.0), 2);
        assert_eq!(analysis.results.len(), 3);
        assert!(analysis.results[0].success);
        assert!(!analysis.results[1].success);
        assert!(analysis.results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("division by zero"));
        assert!(analysis.results[2].success);
    }

    #[test]
    fn test_base_model_is_never_mutated() {
        let m = model(&[("A1", "1"), ("C1", "=A1*2")]);
        let mut engine = RecalcEngine::new();
        impact_analysis(&mut engine, &m, &CellRef::from("A1"), (0.0, 10.0), 4);

        assert_eq!(m.value(&CellRef::from("A1")), Some(&Value::Number(1.0)));
    }

    #[test]
    fn test_sensitivity_result_fits_linear_model() {
        let m = model(&[("A1", "1"), ("C1", "=A1*2")]);
        let mut engine = RecalcEngine::new();

        let analysis = impact_analysis(&mut engine, &m, &CellRef::from("A1"), (0.0, 10.0), 10);
        let fit = sensitivity_result(&analysis, &CellRef::from("C1")).unwrap();

        assert!((fit.sensitivity_coefficient - 2.0).abs() < 1e-9);
        assert!((fit.correlation.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(fit.impact_range, (0.0, 20.0));
        assert_eq!(fit.base_value, 0.0);
        assert_eq!(fit.parameter_reference, CellRef::from("A1"));
    }

    #[test]
    fn test_sensitivity_result_none_for_unaffected_cell() {
        let m = model(&[("A1", "1"), ("C1", "=A1*2"), ("Z1", "5")]);
        let mut engine = RecalcEngine::new();

        let analysis = impact_analysis(&mut engine, &m, &CellRef::from("A1"), (0.0, 10.0), 5);
        // Z1 is never affected, so it never appears in step values.
        assert!(sensitivity_result(&analysis, &CellRef::from("Z1")).is_none());
    }

    #[test]
    fn test_analysis_serializes_for_the_api_layer() {
        let m = model(&[("A1", "1"), ("C1", "=A1*2")]);
        let mut engine = RecalcEngine::new();
        let analysis = impact_analysis(&mut engine, &m, &CellRef::from("A1"), (0.0, 2.0), 2);

        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["parameter"], serde_json::json!("A1"));
        assert_eq!(json["results"].as_array().unwrap().len(), 3);
    }
}
