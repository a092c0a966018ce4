//! Incremental recalculation.
//!
//! The engine owns a per-model dependency-graph cache and recomputes only
//! the cells forward-reachable from a set of edits. Evaluation runs against
//! an overlay of pending values, so a cell computed earlier in the pass is
//! visible to cells computed later, and nothing touches the store until the
//! whole pass succeeds: a single failing cell aborts the batch with the
//! store unchanged.
//!
//! Concurrency: methods take `&mut self` and `&mut Model`, so Rust itself
//! enforces the one-writer-per-model rule. Hosts that share an engine
//! across threads wrap it in a lock.

use std::time::Instant;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::cell::{CellRef, DataType, Value};
use crate::dep_graph::{CycleReport, GraphBuildError, ModelGraph};
use crate::formula::eval::{evaluate, ValueLookup};
use crate::formula::{parser, refs};
use crate::model::{Model, ModelId};

/// An error that occurred while recomputing a specific cell.
#[derive(Debug, Clone, Serialize)]
pub struct RecalcError {
    /// The cell where the error occurred.
    pub cell: CellRef,
    /// Description of the error.
    pub error: String,
}

impl RecalcError {
    pub fn new(cell: CellRef, error: impl Into<String>) -> Self {
        Self {
            cell,
            error: error.into(),
        }
    }
}

/// Result of one recalculation pass.
///
/// Exactly one of `updated_values` (on success) or `error` (on failure) is
/// meaningful. `cycles` is populated when the failure was a circular
/// reference touching the affected set.
#[derive(Debug, Clone, Serialize)]
pub struct RecalcResult {
    pub success: bool,
    /// Size of the affected set: the edits plus every forward-reachable cell.
    pub affected_cells: usize,
    /// Wall-clock seconds for the pass.
    pub calculation_time: f64,
    pub updated_values: FxHashMap<CellRef, Value>,
    pub error: Option<RecalcError>,
    pub cycles: Vec<Vec<CellRef>>,
}

impl RecalcResult {
    fn success(affected: usize, updated: FxHashMap<CellRef, Value>, start: Instant) -> Self {
        Self {
            success: true,
            affected_cells: affected,
            calculation_time: start.elapsed().as_secs_f64(),
            updated_values: updated,
            error: None,
            cycles: Vec::new(),
        }
    }

    fn failure(affected: usize, error: RecalcError, cycles: Vec<Vec<CellRef>>, start: Instant) -> Self {
        log::debug!("recalculation aborted at {}: {}", error.cell, error.error);
        Self {
            success: false,
            affected_cells: affected,
            calculation_time: start.elapsed().as_secs_f64(),
            updated_values: FxHashMap::default(),
            error: Some(error),
            cycles,
        }
    }

    /// Concise one-line summary for logging.
    pub fn summary(&self) -> String {
        match &self.error {
            None => format!(
                "{} cells in {:.2}ms",
                self.affected_cells,
                self.calculation_time * 1000.0
            ),
            Some(e) => format!(
                "failed at {} after {:.2}ms: {}",
                e.cell,
                self.calculation_time * 1000.0,
                e.error
            ),
        }
    }
}

/// Evaluation report for a single cell.
#[derive(Debug, Clone, Serialize)]
pub struct CalculationResult {
    pub value: Option<Value>,
    pub error: Option<String>,
    pub data_type: DataType,
    /// Wall-clock seconds.
    pub calculation_time: f64,
    pub dependencies_used: Vec<CellRef>,
}

/// Pending updates shadow the store during a pass.
struct Overlay<'a> {
    pending: &'a FxHashMap<CellRef, Value>,
    model: &'a Model,
}

impl ValueLookup for Overlay<'_> {
    fn lookup(&self, reference: &CellRef) -> Option<Value> {
        self.pending
            .get(reference)
            .or_else(|| self.model.value(reference))
            .cloned()
    }
}

/// Incremental recalculation engine with a per-model graph cache.
///
/// The cache is keyed by model id and holds the structure revision it was
/// built from; a revision mismatch (formula text changed) triggers a
/// rebuild. `invalidate` drops an entry explicitly, e.g. when a model is
/// unloaded.
#[derive(Debug, Default)]
pub struct RecalcEngine {
    cache: FxHashMap<ModelId, ModelGraph>,
}

impl RecalcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached graph for a model.
    pub fn invalidate(&mut self, id: &ModelId) {
        self.cache.remove(id);
    }

    /// The cached graph for a model, if one is held.
    pub fn cached_graph(&self, id: &ModelId) -> Option<&ModelGraph> {
        self.cache.get(id)
    }

    /// Fetch the model's graph, rebuilding when the cached entry is missing
    /// or structurally stale.
    fn graph_for(&mut self, model: &Model) -> Result<&ModelGraph, GraphBuildError> {
        let stale = match self.cache.get(model.id()) {
            Some(graph) => graph.structure_rev() != model.structure_rev(),
            None => true,
        };
        if stale {
            let graph = ModelGraph::build(model)?;
            log::debug!(
                "built dependency graph for {}: {} formula cells, {} cycle groups",
                model.id(),
                graph.calculation_order().len() + graph.cycles().iter().map(|g| g.len()).sum::<usize>(),
                graph.cycles().len()
            );
            self.cache.insert(model.id().clone(), graph);
        }
        Ok(self
            .cache
            .get(model.id())
            .expect("graph cached by the branch above"))
    }

    /// Apply a set of edits and recompute everything downstream of them.
    ///
    /// Edits must target literal input cells. Any per-cell evaluation
    /// failure aborts the whole pass without committing: downstream cells
    /// may read the failed value, and a partially updated model must never
    /// be returned as if complete.
    pub fn recalculate(
        &mut self,
        model: &mut Model,
        changed: &FxHashMap<CellRef, Value>,
    ) -> RecalcResult {
        let start = Instant::now();

        if changed.is_empty() {
            return RecalcResult::success(0, FxHashMap::default(), start);
        }

        let graph = match self.graph_for(model) {
            Ok(graph) => graph,
            Err(e) => {
                return RecalcResult::failure(
                    0,
                    RecalcError::new(e.cell.clone(), e.error.to_string()),
                    Vec::new(),
                    start,
                )
            }
        };

        for reference in changed.keys() {
            match model.cell(reference) {
                Some(cell) if cell.is_derived() => {
                    return RecalcResult::failure(
                        0,
                        RecalcError::new(
                            reference.clone(),
                            "cell is formula-derived; edit the inputs it reads instead",
                        ),
                        Vec::new(),
                        start,
                    );
                }
                Some(_) => {}
                None => {
                    return RecalcResult::failure(
                        0,
                        RecalcError::new(reference.clone(), "unknown cell"),
                        Vec::new(),
                        start,
                    );
                }
            }
        }

        let affected = graph.affected_by(changed.keys());

        // Cycle members have no valid calculation order. If the edit would
        // flow into one, report the cycles instead of picking an order.
        let touched_cycles: Vec<Vec<CellRef>> = graph
            .cycles()
            .iter()
            .filter(|group| group.iter().any(|c| affected.contains(c)))
            .cloned()
            .collect();
        if !touched_cycles.is_empty() {
            let report = CycleReport::from_groups(&touched_cycles);
            let cell = report.cells[0].clone();
            return RecalcResult::failure(
                affected.len(),
                RecalcError::new(cell, report.message),
                touched_cycles,
                start,
            );
        }

        // Filter the full calculation order down to the affected cells;
        // relative order is preserved, so every affected cell still comes
        // after all of its own precedents.
        let order: Vec<&CellRef> = graph
            .calculation_order()
            .iter()
            .filter(|c| affected.contains(*c))
            .collect();

        let mut pending: FxHashMap<CellRef, Value> = changed.clone();
        for reference in order {
            let Some(source) = model.cell(reference).and_then(|c| c.formula.clone()) else {
                continue;
            };
            let overlay = Overlay {
                pending: &pending,
                model,
            };
            match evaluate(&source, &overlay) {
                Ok(value) => {
                    pending.insert(reference.clone(), value);
                }
                Err(e) => {
                    return RecalcResult::failure(
                        affected.len(),
                        RecalcError::new(reference.clone(), e.to_string()),
                        Vec::new(),
                        start,
                    );
                }
            }
        }

        for (reference, value) in &pending {
            model.apply_update(reference, value.clone());
        }

        let result = RecalcResult::success(affected.len(), pending, start);
        log::debug!("recalc[{}]: {}", model.id(), result.summary());
        result
    }

    /// Evaluate every formula cell in dependency order.
    ///
    /// Used after model ingestion to establish derived values. Fails up
    /// front if the model contains circular references.
    pub fn recalculate_all(&mut self, model: &mut Model) -> RecalcResult {
        let start = Instant::now();

        let graph = match self.graph_for(model) {
            Ok(graph) => graph,
            Err(e) => {
                return RecalcResult::failure(
                    0,
                    RecalcError::new(e.cell.clone(), e.error.to_string()),
                    Vec::new(),
                    start,
                )
            }
        };

        if graph.has_cycles() {
            let cycles = graph.cycles().to_vec();
            let report = CycleReport::from_groups(&cycles);
            let cell = report.cells[0].clone();
            return RecalcResult::failure(
                graph.calculation_order().len(),
                RecalcError::new(cell, report.message),
                cycles,
                start,
            );
        }

        let order: Vec<CellRef> = graph.calculation_order().to_vec();
        let mut pending: FxHashMap<CellRef, Value> = FxHashMap::default();
        for reference in &order {
            let Some(source) = model.cell(reference).and_then(|c| c.formula.clone()) else {
                continue;
            };
            let overlay = Overlay {
                pending: &pending,
                model,
            };
            match evaluate(&source, &overlay) {
                Ok(value) => {
                    pending.insert(reference.clone(), value);
                }
                Err(e) => {
                    return RecalcResult::failure(
                        order.len(),
                        RecalcError::new(reference.clone(), e.to_string()),
                        Vec::new(),
                        start,
                    );
                }
            }
        }

        for (reference, value) in &pending {
            model.apply_update(reference, value.clone());
        }

        let result = RecalcResult::success(order.len(), pending, start);
        log::debug!("recalc-all[{}]: {}", model.id(), result.summary());
        result
    }

    /// Evaluate a single cell against the store's current values, without
    /// committing anything.
    pub fn calculate_cell(&self, model: &Model, reference: &CellRef) -> CalculationResult {
        let start = Instant::now();

        let Some(cell) = model.cell(reference) else {
            return CalculationResult {
                value: None,
                error: Some(format!("unknown cell {}", reference)),
                data_type: DataType::Empty,
                calculation_time: start.elapsed().as_secs_f64(),
                dependencies_used: Vec::new(),
            };
        };

        let Some(source) = cell.formula.as_deref() else {
            return CalculationResult {
                value: Some(cell.value.clone()),
                error: None,
                data_type: cell.data_type(),
                calculation_time: start.elapsed().as_secs_f64(),
                dependencies_used: Vec::new(),
            };
        };

        let dependencies_used = match parser::parse(source).and_then(|e| refs::extract_refs(&e)) {
            Ok(set) => {
                let mut deps: Vec<CellRef> = set.into_iter().collect();
                deps.sort();
                deps
            }
            Err(e) => {
                return CalculationResult {
                    value: None,
                    error: Some(e.to_string()),
                    data_type: DataType::Empty,
                    calculation_time: start.elapsed().as_secs_f64(),
                    dependencies_used: Vec::new(),
                };
            }
        };

        match evaluate(source, model) {
            Ok(value) => CalculationResult {
                data_type: value.data_type(),
                value: Some(value),
                error: None,
                calculation_time: start.elapsed().as_secs_f64(),
                dependencies_used,
            },
            Err(e) => CalculationResult {
                value: None,
                error: Some(e.to_string()),
                data_type: DataType::Empty,
                calculation_time: start.elapsed().as_secs_f64(),
                dependencies_used,
            },
        }
    }
}
