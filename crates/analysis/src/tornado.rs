//! Tornado and spider analyses.
//!
//! Both vary parameters one at a time around the base case. Tornado pins
//! each parameter at its declared low and high bounds; spider sweeps
//! symmetric relative offsets. All other parameters stay at their base
//! values (whatever the model currently holds).

use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use serde::Serialize;

use finvision_engine::cell::{CellRef, Value};
use finvision_engine::model::Model;
use finvision_engine::recalc::RecalcEngine;
use finvision_engine::validation::Parameter;

use crate::{isolated_run, target_number};

/// One parameter's bar in a tornado chart.
#[derive(Debug, Clone, Serialize)]
pub struct TornadoBar {
    pub parameter: CellRef,
    pub low_value: f64,
    pub high_value: f64,
    /// Target output with the parameter at its low bound.
    pub low_output: f64,
    /// Target output with the parameter at its high bound.
    pub high_output: f64,
    /// |high_output - low_output|; the ranking key.
    pub swing: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TornadoAnalysis {
    pub target: CellRef,
    /// Target value in the unmodified base model, when numeric.
    pub base_output: Option<f64>,
    /// Bars ranked by swing, descending.
    pub bars: Vec<TornadoBar>,
    /// Parameters that could not be analyzed, with the reason.
    pub skipped: Vec<(CellRef, String)>,
}

/// Pin each parameter at its declared bounds, holding the others at base,
/// and rank by the swing induced on `target`.
pub fn tornado_analysis(
    engine: &mut RecalcEngine,
    model: &Model,
    parameters: &[Parameter],
    target: &CellRef,
) -> TornadoAnalysis {
    let base_output = target_number(model, target);
    let mut bars = Vec::new();
    let mut skipped = Vec::new();

    for parameter in parameters {
        let (Some(low), Some(high)) = (parameter.min_value, parameter.max_value) else {
            skipped.push((parameter.reference.clone(), "no declared bounds".to_string()));
            continue;
        };

        match (
            run_point(engine, model, &parameter.reference, low, target),
            run_point(engine, model, &parameter.reference, high, target),
        ) {
            (Ok(low_output), Ok(high_output)) => bars.push(TornadoBar {
                parameter: parameter.reference.clone(),
                low_value: low,
                high_value: high,
                low_output,
                high_output,
                swing: (high_output - low_output).abs(),
            }),
            (Err(reason), _) | (_, Err(reason)) => {
                log::debug!("tornado skips {}: {}", parameter.reference, reason);
                skipped.push((parameter.reference.clone(), reason));
            }
        }
    }

    bars.sort_by(|a, b| {
        OrderedFloat(b.swing)
            .cmp(&OrderedFloat(a.swing))
            .then_with(|| a.parameter.cmp(&b.parameter))
    });

    TornadoAnalysis {
        target: target.clone(),
        base_output,
        bars,
        skipped,
    }
}

/// One evaluated offset in a spider series.
#[derive(Debug, Clone, Serialize)]
pub struct SpiderPoint {
    /// Relative offset from base, e.g. -0.2 for -20%.
    pub offset: f64,
    pub parameter_value: f64,
    pub target_value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpiderSeries {
    pub parameter: CellRef,
    pub points: Vec<SpiderPoint>,
}

/// Sweep each parameter across symmetric relative offsets around its base
/// value: `2 * steps_per_side + 1` points from `-max_offset` to
/// `+max_offset`, base included. Parameters with a zero base are skipped
/// (a relative offset cannot move them); failed points are dropped from
/// that parameter's series.
pub fn spider_analysis(
    engine: &mut RecalcEngine,
    model: &Model,
    parameters: &[Parameter],
    target: &CellRef,
    max_offset: f64,
    steps_per_side: usize,
) -> Vec<SpiderSeries> {
    let steps_per_side = steps_per_side.max(1) as i64;
    let mut series = Vec::new();

    for parameter in parameters {
        let base = parameter.current_value;
        if base == 0.0 {
            log::warn!(
                "spider analysis skips {}: relative offsets need a nonzero base",
                parameter.reference
            );
            continue;
        }

        let mut points = Vec::new();
        for i in -steps_per_side..=steps_per_side {
            let offset = max_offset * i as f64 / steps_per_side as f64;
            let value = base * (1.0 + offset);
            match run_point(engine, model, &parameter.reference, value, target) {
                Ok(target_value) => points.push(SpiderPoint {
                    offset,
                    parameter_value: value,
                    target_value,
                }),
                Err(reason) => {
                    log::debug!(
                        "spider point {}={} failed: {}",
                        parameter.reference,
                        value,
                        reason
                    );
                }
            }
        }

        series.push(SpiderSeries {
            parameter: parameter.reference.clone(),
            points,
        });
    }

    series
}

/// Recalculate with one parameter pinned and read the target.
fn run_point(
    engine: &mut RecalcEngine,
    model: &Model,
    parameter: &CellRef,
    value: f64,
    target: &CellRef,
) -> Result<f64, String> {
    let mut edits = FxHashMap::default();
    edits.insert(parameter.clone(), Value::Number(value));
    let (scratch, outcome) = isolated_run(engine, model, edits);
    if !outcome.success {
        return Err(outcome
            .error
            .map(|e| format!("{}: {}", e.cell, e.error))
            .unwrap_or_else(|| "recalculation failed".to_string()));
    }
    target_number(&scratch, target).ok_or_else(|| format!("target {} is not numeric", target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use finvision_engine::cell::Cell;

    fn model(cells: &[(&str, &str)]) -> Model {
        Model::with_cells(
            "tornado-test",
            cells
                .iter()
                .map(|(r, input)| (CellRef::from(*r), Cell::from_input(input))),
        )
    }

    fn recalculated(cells: &[(&str, &str)]) -> (Model, RecalcEngine) {
        let mut m = model(cells);
        let mut engine = RecalcEngine::new();
        assert!(engine.recalculate_all(&mut m).success);
        (m, engine)
    }

    #[test]
    fn test_tornado_ranks_by_swing() {
        let (m, mut engine) =
            recalculated(&[("A1", "5"), ("X1", "0.5"), ("B1", "=A1*2+X1")]);
        let parameters = vec![
            Parameter::new("X1", 0.5).with_bounds(0.0, 1.0),
            Parameter::new("A1", 5.0).with_bounds(0.0, 10.0),
        ];

        let analysis = tornado_analysis(&mut engine, &m, &parameters, &CellRef::from("B1"));
        assert_eq!(analysis.bars.len(), 2);
        // A1 swings B1 by 20, X1 by 1.
        assert_eq!(analysis.bars[0].parameter, CellRef::from("A1"));
        assert_eq!(analysis.bars[0].swing, 20.0);
        assert_eq!(analysis.bars[1].parameter, CellRef::from("X1"));
        assert_eq!(analysis.bars[1].swing, 1.0);
        assert_eq!(analysis.base_output, Some(10.5));
    }

    #[test]
    fn test_tornado_holds_other_parameters_at_base() {
        let (m, mut engine) = recalculated(&[("A1", "5"), ("X1", "0.5"), ("B1", "=A1*2+X1")]);
        let parameters = vec![Parameter::new("A1", 5.0).with_bounds(0.0, 10.0)];

        let analysis = tornado_analysis(&mut engine, &m, &parameters, &CellRef::from("B1"));
        // X1 stays at 0.5 in both runs.
        assert_eq!(analysis.bars[0].low_output, 0.5);
        assert_eq!(analysis.bars[0].high_output, 20.5);
    }

    #[test]
    fn test_tornado_skips_unbounded_parameters() {
        let (m, mut engine) = recalculated(&[("A1", "5"), ("B1", "=A1*2")]);
        let parameters = vec![Parameter::new("A1", 5.0)];

        let analysis = tornado_analysis(&mut engine, &m, &parameters, &CellRef::from("B1"));
        assert!(analysis.bars.is_empty());
        assert_eq!(analysis.skipped.len(), 1);
        assert!(analysis.skipped[0].1.contains("no declared bounds"));
    }

    #[test]
    fn test_tornado_records_failing_parameter() {
        let (m, mut engine) = recalculated(&[("A1", "1"), ("B1", "=LN(A1)")]);
        let parameters = vec![Parameter::new("A1", 1.0).with_bounds(-1.0, 2.0)];

        let analysis = tornado_analysis(&mut engine, &m, &parameters, &CellRef::from("B1"));
        assert!(analysis.bars.is_empty());
        assert_eq!(analysis.skipped.len(), 1);
    }

    #[test]
    fn test_spider_sweeps_symmetric_offsets() {
        let (m, mut engine) = recalculated(&[("A1", "10"), ("B1", "=A1*2")]);
        let parameters = vec![Parameter::new("A1", 10.0)];

        let series =
            spider_analysis(&mut engine, &m, &parameters, &CellRef::from("B1"), 0.3, 3);
        assert_eq!(series.len(), 1);
        let points = &series[0].points;
        assert_eq!(points.len(), 7);
        assert_eq!(points[0].offset, -0.3);
        assert_eq!(points[3].offset, 0.0);
        assert_eq!(points[3].target_value, 20.0);
        assert!((points[6].target_value - 26.0).abs() < 1e-9);
    }

    #[test]
    fn test_spider_skips_zero_base_parameter() {
        let (m, mut engine) = recalculated(&[("A1", "0"), ("B1", "=A1*2")]);
        let parameters = vec![Parameter::new("A1", 0.0)];

        let series =
            spider_analysis(&mut engine, &m, &parameters, &CellRef::from("B1"), 0.3, 3);
        assert!(series.is_empty());
    }
}
