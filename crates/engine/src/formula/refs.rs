// Static reference extraction.
//
// Walks a formula AST and collects every cell reference it reads, with
// ranges expanded to their member cells. This is the dependency graph
// builder's input: edges are wired from these sets, so the extraction must
// see exactly what the evaluator will read.

use rustc_hash::FxHashSet;

use crate::cell::CellRef;

use super::eval::EvalError;
use super::parser::{render_ref, Expr, RangeRef};

/// Upper bound on range expansion. A range larger than this is almost
/// certainly a mis-typed reference and would bloat the graph.
pub const MAX_RANGE_CELLS: usize = 65_536;

/// Collect the set of cell references a formula reads.
///
/// Duplicate references collapse (set semantics); a range contributes one
/// reference per member cell.
pub fn extract_refs(expr: &Expr) -> Result<FxHashSet<CellRef>, EvalError> {
    let mut refs = FxHashSet::default();
    walk(expr, &mut refs)?;
    Ok(refs)
}

fn walk(expr: &Expr, refs: &mut FxHashSet<CellRef>) -> Result<(), EvalError> {
    match expr {
        Expr::Ref(reference) => {
            refs.insert(reference.clone());
        }
        Expr::Range(range) => {
            refs.extend(expand_range(range)?);
        }
        Expr::Function { args, .. } => {
            for arg in args {
                walk(arg, refs)?;
            }
        }
        Expr::Neg(inner) => walk(inner, refs)?,
        Expr::BinaryOp { left, right, .. } => {
            walk(left, refs)?;
            walk(right, refs)?;
        }
        Expr::Number(_) | Expr::Text(_) | Expr::Boolean(_) => {}
    }
    Ok(())
}

/// Expand a range to its member cell references, row-major.
pub(crate) fn expand_range(range: &RangeRef) -> Result<Vec<CellRef>, EvalError> {
    let count = range.cell_count();
    if count > MAX_RANGE_CELLS {
        return Err(EvalError::RangeTooLarge {
            range: range.to_a1(),
            cells: count,
        });
    }
    let mut members = Vec::with_capacity(count);
    for row in range.start_row..=range.end_row {
        for col in range.start_col..=range.end_col {
            members.push(CellRef::new(render_ref(range.sheet.as_deref(), col, row)));
        }
    }
    Ok(members)
}
