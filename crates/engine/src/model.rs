//! The cell store: a model's cells keyed by reference.
//!
//! The `Model` exclusively owns cell state. Formula cells are derived; their
//! values are written only by the recalculation engine. The store tracks a
//! structure revision so the recalculator's graph cache can tell structural
//! changes (formula text edited) apart from value-only changes, which never
//! require a graph rebuild.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cell::{Cell, CellRef, Value};
use crate::formula::eval::ValueLookup;

/// Identifier for one model; the recalculation engine caches one dependency
/// graph per model id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Error from a direct store edit.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The target cell is formula-derived; its value is evaluation output,
    /// never a direct write.
    #[error("cell {0} is formula-derived; its value is set by recalculation")]
    DerivedCell(CellRef),
}

/// A financial model's cell store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    id: ModelId,
    cells: FxHashMap<CellRef, Cell>,
    /// Bumped on every formula-text change. Value edits leave it untouched.
    structure_rev: u64,
}

impl Model {
    pub fn new(id: impl Into<ModelId>) -> Self {
        Self {
            id: id.into(),
            cells: FxHashMap::default(),
            structure_rev: 0,
        }
    }

    /// Build a model from an ingested `{reference: cell}` map.
    pub fn with_cells(
        id: impl Into<ModelId>,
        cells: impl IntoIterator<Item = (CellRef, Cell)>,
    ) -> Self {
        let mut model = Self::new(id);
        for (reference, cell) in cells {
            if cell.is_derived() {
                model.structure_rev += 1;
            }
            model.cells.insert(reference, cell);
        }
        model
    }

    pub fn id(&self) -> &ModelId {
        &self.id
    }

    pub fn structure_rev(&self) -> u64 {
        self.structure_rev
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, reference: &CellRef) -> Option<&Cell> {
        self.cells.get(reference)
    }

    pub fn value(&self, reference: &CellRef) -> Option<&Value> {
        self.cells.get(reference).map(|c| &c.value)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&CellRef, &Cell)> {
        self.cells.iter()
    }

    /// All formula cells with their source text.
    pub fn formulas(&self) -> impl Iterator<Item = (&CellRef, &str)> {
        self.cells
            .iter()
            .filter_map(|(r, c)| c.formula.as_deref().map(|f| (r, f)))
    }

    /// Set a literal input value. Rejected for formula cells; those are only
    /// written by recalculation.
    pub fn set_value(
        &mut self,
        reference: impl Into<CellRef>,
        value: Value,
    ) -> Result<(), StoreError> {
        let reference = reference.into();
        match self.cells.get_mut(&reference) {
            Some(cell) if cell.is_derived() => Err(StoreError::DerivedCell(reference)),
            Some(cell) => {
                cell.value = value;
                Ok(())
            }
            None => {
                self.cells.insert(reference, Cell::literal(value));
                Ok(())
            }
        }
    }

    /// Install or replace a cell's formula. Always a structural change:
    /// bumps the revision so cached dependency graphs are rebuilt.
    pub fn set_formula(&mut self, reference: impl Into<CellRef>, source: impl Into<String>) {
        self.cells
            .insert(reference.into(), Cell::with_formula(source));
        self.structure_rev += 1;
    }

    /// Remove a cell entirely. Removing a formula cell is structural.
    pub fn remove(&mut self, reference: &CellRef) -> Option<Cell> {
        let removed = self.cells.remove(reference);
        if removed.as_ref().is_some_and(|c| c.is_derived()) {
            self.structure_rev += 1;
        }
        removed
    }

    /// Write an evaluated value into a cell, derived or not. Reserved for
    /// the recalculation engine's commit step.
    pub(crate) fn apply_update(&mut self, reference: &CellRef, value: Value) {
        match self.cells.get_mut(reference) {
            Some(cell) => cell.value = value,
            None => {
                self.cells.insert(reference.clone(), Cell::literal(value));
            }
        }
    }
}

/// A model's live values are a binding environment: formulas resolve
/// references straight from the store.
impl ValueLookup for Model {
    fn lookup(&self, reference: &CellRef) -> Option<Value> {
        self.value(reference).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_value_rejected_on_formula_cell() {
        let mut model = Model::new("m1");
        model.set_formula("B1", "=A1*2");

        let err = model.set_value("B1", Value::Number(5.0)).unwrap_err();
        assert!(matches!(err, StoreError::DerivedCell(_)));
    }

    #[test]
    fn test_value_edit_does_not_bump_structure_rev() {
        let mut model = Model::new("m1");
        model.set_value("A1", Value::Number(1.0)).unwrap();
        let rev = model.structure_rev();

        model.set_value("A1", Value::Number(2.0)).unwrap();
        assert_eq!(model.structure_rev(), rev);
    }

    #[test]
    fn test_formula_edit_bumps_structure_rev() {
        let mut model = Model::new("m1");
        let rev = model.structure_rev();

        model.set_formula("B1", "=A1*2");
        assert_eq!(model.structure_rev(), rev + 1);

        model.set_formula("B1", "=A1*3");
        assert_eq!(model.structure_rev(), rev + 2);
    }

    #[test]
    fn test_remove_formula_cell_is_structural() {
        let mut model = Model::new("m1");
        model.set_formula("B1", "=A1*2");
        model.set_value("A1", Value::Number(1.0)).unwrap();
        let rev = model.structure_rev();

        model.remove(&CellRef::from("A1"));
        assert_eq!(model.structure_rev(), rev);

        model.remove(&CellRef::from("B1"));
        assert_eq!(model.structure_rev(), rev + 1);
    }

    #[test]
    fn test_with_cells_counts_formulas() {
        let model = Model::with_cells(
            "m1",
            vec![
                (CellRef::from("A1"), Cell::literal(Value::Number(1.0))),
                (CellRef::from("B1"), Cell::with_formula("=A1*2")),
            ],
        );
        assert_eq!(model.len(), 2);
        assert_eq!(model.formulas().count(), 1);
        assert!(model.structure_rev() > 0);
    }
}
