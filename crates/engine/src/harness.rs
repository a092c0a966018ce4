//! Test helpers for building models without ingestion plumbing.

use rustc_hash::FxHashMap;

use crate::cell::{Cell, CellRef, Value};
use crate::model::Model;

/// Build a model from `(reference, input)` pairs. Inputs starting with `=`
/// become formulas; numeric text becomes numbers; the rest is text.
pub fn model(id: &str, cells: &[(&str, &str)]) -> Model {
    Model::with_cells(
        id,
        cells
            .iter()
            .map(|(r, input)| (CellRef::from(*r), Cell::from_input(input))),
    )
}

/// Build a numeric edit map.
pub fn edits(entries: &[(&str, f64)]) -> FxHashMap<CellRef, Value> {
    entries
        .iter()
        .map(|(r, v)| (CellRef::from(*r), Value::Number(*v)))
        .collect()
}

/// Read a cell's value as a number, panicking on anything unexpected.
pub fn number(model: &Model, reference: &str) -> f64 {
    model
        .value(&CellRef::from(reference))
        .unwrap_or_else(|| panic!("cell {} missing", reference))
        .to_number()
        .unwrap_or_else(|e| panic!("cell {} not numeric: {}", reference, e))
}
