//! Dependency graph for formula cells.
//!
//! Tracks precedents (cells a formula reads) and dependents (cells that
//! read a given cell) for forward-reachability queries and ordered
//! recomputation.
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B's formula reads A"  (A is a precedent of B)
//! ```
//!
//! This makes "what must be recomputed if X changes?" a walk over outgoing
//! edges.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::cell::CellRef;
use crate::formula::eval::EvalError;
use crate::formula::{parser, refs};
use crate::model::Model;

/// Bidirectional adjacency over cell references.
///
/// # Invariants
///
/// 1. **Bidirectional consistency:** if A ∈ preds[B] then B ∈ succs[A], and
///    vice versa.
/// 2. **No dangling entries:** empty sets are removed, not stored.
/// 3. **No duplicate edges:** set semantics.
/// 4. **Atomic updates:** `replace_edges` is the only mutator that touches
///    both maps.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    /// For each formula cell B, the cells it reads.
    preds: FxHashMap<CellRef, FxHashSet<CellRef>>,
    /// For each referenced cell A, the formula cells that read it.
    succs: FxHashMap<CellRef, FxHashSet<CellRef>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cells this formula cell reads (incoming edges).
    pub fn precedents<'a>(&'a self, cell: &CellRef) -> impl Iterator<Item = &'a CellRef> + 'a {
        self.preds.get(cell).into_iter().flatten()
    }

    /// Cells that read this cell (outgoing edges).
    pub fn dependents<'a>(&'a self, cell: &CellRef) -> impl Iterator<Item = &'a CellRef> + 'a {
        self.succs.get(cell).into_iter().flatten()
    }

    pub fn precedent_count(&self, cell: &CellRef) -> usize {
        self.preds.get(cell).map_or(0, |s| s.len())
    }

    pub fn dependent_count(&self, cell: &CellRef) -> usize {
        self.succs.get(cell).map_or(0, |s| s.len())
    }

    /// True if this cell has tracked precedents.
    pub fn has_precedents(&self, cell: &CellRef) -> bool {
        self.preds.contains_key(cell)
    }

    /// Number of cells with at least one precedent.
    pub fn formula_cell_count(&self) -> usize {
        self.preds.len()
    }

    /// Number of cells referenced by at least one formula.
    pub fn referenced_cell_count(&self) -> usize {
        self.succs.len()
    }

    /// Replace all edges for a formula cell atomically.
    ///
    /// Removes the cell from its old precedents' dependent sets, then wires
    /// the new set. Pass an empty set to clear the cell's edges.
    pub fn replace_edges(&mut self, formula_cell: CellRef, new_preds: FxHashSet<CellRef>) {
        if let Some(old_preds) = self.preds.remove(&formula_cell) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(&formula_cell);
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }

        if new_preds.is_empty() {
            return;
        }

        for pred in &new_preds {
            self.succs
                .entry(pred.clone())
                .or_default()
                .insert(formula_cell.clone());
        }
        self.preds.insert(formula_cell, new_preds);
    }

    /// Clear all edges for a cell (formula removed or cell deleted).
    pub fn clear_cell(&mut self, cell: &CellRef) {
        self.replace_edges(cell.clone(), FxHashSet::default());
    }

    /// Forward reachability: the seeds plus every cell transitively
    /// reachable from them over dependent edges.
    pub fn reachable_from<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a CellRef>,
    ) -> FxHashSet<CellRef> {
        let mut visited: FxHashSet<CellRef> = FxHashSet::default();
        let mut stack: Vec<CellRef> = Vec::new();
        for seed in seeds {
            if visited.insert(seed.clone()) {
                stack.push(seed.clone());
            }
        }
        while let Some(current) = stack.pop() {
            for dep in self.dependents(&current) {
                if visited.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }
        visited
    }

    // =========================================================================
    // Cycle detection (Tarjan's SCC) and topological ordering (Kahn)
    // =========================================================================

    /// Find all cycle groups: SCCs of size > 1, plus self-loops.
    ///
    /// Iterative Tarjan over an index-mapped view of the graph, so deep
    /// chains cannot overflow the call stack. Nodes are indexed in sorted
    /// reference order, which makes the output deterministic: each group is
    /// sorted, and groups are sorted by their first member.
    pub fn find_cycle_sccs(&self) -> Vec<Vec<CellRef>> {
        let mut nodes: Vec<&CellRef> = self.preds.keys().collect();
        nodes.sort();
        if nodes.is_empty() {
            return Vec::new();
        }

        let index_of: FxHashMap<&CellRef, usize> =
            nodes.iter().enumerate().map(|(i, r)| (*r, i)).collect();

        // Adjacency in the depends-on direction, the natural cycle walk.
        let adjacency: Vec<Vec<usize>> = nodes
            .iter()
            .map(|node| {
                let mut neighbours: Vec<usize> = self
                    .precedents(node)
                    .filter_map(|p| index_of.get(&p).copied())
                    .collect();
                neighbours.sort_unstable();
                neighbours
            })
            .collect();

        const UNVISITED: usize = usize::MAX;
        let n = nodes.len();
        let mut indices = vec![UNVISITED; n];
        let mut lowlinks = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut counter = 0usize;
        let mut sccs: Vec<Vec<usize>> = Vec::new();

        struct Frame {
            node: usize,
            next: usize,
        }

        for root in 0..n {
            if indices[root] != UNVISITED {
                continue;
            }

            let mut dfs: Vec<Frame> = Vec::new();
            indices[root] = counter;
            lowlinks[root] = counter;
            counter += 1;
            stack.push(root);
            on_stack[root] = true;
            dfs.push(Frame { node: root, next: 0 });

            while let Some(frame) = dfs.last_mut() {
                let v = frame.node;
                if frame.next < adjacency[v].len() {
                    let w = adjacency[v][frame.next];
                    frame.next += 1;

                    if indices[w] == UNVISITED {
                        indices[w] = counter;
                        lowlinks[w] = counter;
                        counter += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        dfs.push(Frame { node: w, next: 0 });
                    } else if on_stack[w] {
                        lowlinks[v] = lowlinks[v].min(indices[w]);
                    }
                } else {
                    dfs.pop();
                    if let Some(parent) = dfs.last() {
                        lowlinks[parent.node] = lowlinks[parent.node].min(lowlinks[v]);
                    }
                    if lowlinks[v] == indices[v] {
                        let mut scc = Vec::new();
                        loop {
                            let w = stack.pop().expect("Tarjan stack underflow");
                            on_stack[w] = false;
                            scc.push(w);
                            if w == v {
                                break;
                            }
                        }
                        let is_cycle = scc.len() > 1 || adjacency[v].contains(&v);
                        if is_cycle {
                            scc.sort_unstable();
                            sccs.push(scc);
                        }
                    }
                }
            }
        }

        let mut groups: Vec<Vec<CellRef>> = sccs
            .into_iter()
            .map(|scc| scc.into_iter().map(|i| nodes[i].clone()).collect())
            .collect();
        groups.sort_by(|a, b| a[0].cmp(&b[0]));
        groups
    }

    /// Order `cells` so that every cell comes after all of its precedents,
    /// skipping `skip` (cycle members, which have no valid position).
    ///
    /// Kahn's algorithm with a lexicographic tie-break for determinism.
    /// Cells downstream of a skipped cycle are still ordered; they evaluate
    /// against the cycle cells' last-known values.
    pub fn calculation_order(
        &self,
        cells: &[CellRef],
        skip: &FxHashSet<CellRef>,
    ) -> Vec<CellRef> {
        let mut nodes: Vec<&CellRef> = cells.iter().filter(|c| !skip.contains(*c)).collect();
        nodes.sort();
        nodes.dedup();

        let index_of: FxHashMap<&CellRef, usize> =
            nodes.iter().enumerate().map(|(i, r)| (*r, i)).collect();

        let mut in_degree = vec![0usize; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            in_degree[i] = self
                .precedents(node)
                .filter(|p| index_of.contains_key(p))
                .count();
        }

        // Min-heap on node index; indices follow sorted reference order.
        let mut ready: std::collections::BinaryHeap<std::cmp::Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| std::cmp::Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(std::cmp::Reverse(i)) = ready.pop() {
            let node = nodes[i];
            order.push(node.clone());
            for dep in self.dependents(node) {
                if let Some(&j) = index_of.get(&dep) {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        ready.push(std::cmp::Reverse(j));
                    }
                }
            }
        }

        order
    }
}

// =============================================================================
// CycleReport
// =============================================================================

/// Report describing circular references, surfaced as data so callers can
/// decide policy.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cells participating in cycles.
    pub cells: Vec<CellRef>,
    /// Human-readable description.
    pub message: String,
}

impl CycleReport {
    pub fn new(cells: Vec<CellRef>, message: impl Into<String>) -> Self {
        Self {
            cells,
            message: message.into(),
        }
    }

    /// Report for a self-referencing cell.
    pub fn self_reference(cell: CellRef) -> Self {
        let message = format!("Cell {} references itself", cell);
        Self {
            cells: vec![cell],
            message,
        }
    }

    /// Report for a multi-cell cycle.
    pub fn cycle(cells: Vec<CellRef>) -> Self {
        if cells.len() == 1 {
            return Self::self_reference(cells.into_iter().next().expect("one cell"));
        }
        let names: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        let message = if cells.len() <= 5 {
            format!("Circular reference: {}", names.join(" -> "))
        } else {
            format!(
                "Circular reference involving {} cells: {} -> ... -> {}",
                cells.len(),
                names[0],
                names.last().expect("nonempty cycle")
            )
        };
        Self { cells, message }
    }

    /// Summarize a set of cycle groups into one report.
    pub fn from_groups(groups: &[Vec<CellRef>]) -> Self {
        let cells: Vec<CellRef> = groups.iter().flatten().cloned().collect();
        if groups.len() == 1 {
            return Self::cycle(cells);
        }
        let message = format!(
            "{} circular reference groups involving {} cells",
            groups.len(),
            cells.len()
        );
        Self { cells, message }
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CycleReport {}

// =============================================================================
// ModelGraph: the built, cached artifact
// =============================================================================

/// A formula failed to parse while wiring the graph.
#[derive(Debug, Clone, Error)]
#[error("formula in {cell}: {error}")]
pub struct GraphBuildError {
    pub cell: CellRef,
    pub error: EvalError,
}

/// Dependency graph built for one model revision.
///
/// Owned and cached by the recalculation engine, keyed by model id, and
/// rebuilt whenever the model's structure revision moves. Value-only edits
/// never invalidate it.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    deps: DepGraph,
    /// Topological order over non-cyclic formula cells.
    calculation_order: Vec<CellRef>,
    /// Cycle groups. When non-empty, `calculation_order` is not
    /// authoritative for these cells - callers must check.
    cycles: Vec<Vec<CellRef>>,
    structure_rev: u64,
}

impl ModelGraph {
    /// Parse every formula in the model and wire the graph.
    pub fn build(model: &Model) -> Result<Self, GraphBuildError> {
        let mut deps = DepGraph::new();
        let mut formula_cells: Vec<CellRef> = Vec::new();

        for (reference, source) in model.formulas() {
            let expr = parser::parse(source).map_err(|error| GraphBuildError {
                cell: reference.clone(),
                error,
            })?;
            let reads = refs::extract_refs(&expr).map_err(|error| GraphBuildError {
                cell: reference.clone(),
                error,
            })?;
            deps.replace_edges(reference.clone(), reads);
            formula_cells.push(reference.clone());
        }

        let cycles = deps.find_cycle_sccs();
        let cyclic: FxHashSet<CellRef> = cycles.iter().flatten().cloned().collect();
        let calculation_order = deps.calculation_order(&formula_cells, &cyclic);

        Ok(Self {
            deps,
            calculation_order,
            cycles,
            structure_rev: model.structure_rev(),
        })
    }

    pub fn deps(&self) -> &DepGraph {
        &self.deps
    }

    pub fn calculation_order(&self) -> &[CellRef] {
        &self.calculation_order
    }

    pub fn cycles(&self) -> &[Vec<CellRef>] {
        &self.cycles
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    pub fn cycle_members(&self) -> FxHashSet<&CellRef> {
        self.cycles.iter().flatten().collect()
    }

    /// The model structure revision this graph was built from.
    pub fn structure_rev(&self) -> u64 {
        self.structure_rev
    }

    /// The changed cells plus everything forward-reachable from them.
    pub fn affected_by<'a>(
        &self,
        changed: impl IntoIterator<Item = &'a CellRef>,
    ) -> FxHashSet<CellRef> {
        self.deps.reachable_from(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> CellRef {
        CellRef::from(s)
    }

    fn set(cells: &[&str]) -> FxHashSet<CellRef> {
        cells.iter().map(|c| r(c)).collect()
    }

    fn cells(names: &[&str]) -> Vec<CellRef> {
        names.iter().map(|c| r(c)).collect()
    }

    #[test]
    fn test_empty_graph() {
        let graph = DepGraph::new();
        assert_eq!(graph.formula_cell_count(), 0);
        assert_eq!(graph.referenced_cell_count(), 0);
        assert!(!graph.has_precedents(&r("A1")));
        assert_eq!(graph.precedents(&r("A1")).count(), 0);
    }

    #[test]
    fn test_single_edge() {
        // B1 = A1
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));

        assert!(graph.has_precedents(&r("B1")));
        assert!(!graph.has_precedents(&r("A1")));
        assert_eq!(graph.precedents(&r("B1")).collect::<Vec<_>>(), vec![&r("A1")]);
        assert_eq!(graph.dependents(&r("A1")).collect::<Vec<_>>(), vec![&r("B1")]);
    }

    #[test]
    fn test_rewiring_removes_stale_edges() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("B1"), set(&["A2"]));

        assert_eq!(graph.dependents(&r("A1")).count(), 0);
        assert_eq!(graph.dependents(&r("A2")).count(), 1);
        // A1 entry is fully removed, not left empty.
        assert_eq!(graph.referenced_cell_count(), 1);
    }

    #[test]
    fn test_clear_cell() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.clear_cell(&r("B1"));

        assert_eq!(graph.formula_cell_count(), 0);
        assert_eq!(graph.referenced_cell_count(), 0);
    }

    #[test]
    fn test_reachable_from_includes_seeds() {
        // A1 -> B1 -> C1
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["B1"]));

        let reachable = graph.reachable_from([&r("A1")]);
        assert_eq!(reachable, set(&["A1", "B1", "C1"]));

        let reachable = graph.reachable_from([&r("C1")]);
        assert_eq!(reachable, set(&["C1"]));
    }

    #[test]
    fn test_topo_order_chain() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["B1"]));
        graph.replace_edges(r("D1"), set(&["C1"]));

        let order = graph.calculation_order(&cells(&["B1", "C1", "D1"]), &FxHashSet::default());
        assert_eq!(order, cells(&["B1", "C1", "D1"]));
    }

    #[test]
    fn test_topo_order_is_valid_for_diamond() {
        //     A1 (input)
        //    /  \
        //   B1   C1
        //    \  /
        //     D1
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["A1"]));
        graph.replace_edges(r("D1"), set(&["B1", "C1"]));

        let order = graph.calculation_order(&cells(&["B1", "C1", "D1"]), &FxHashSet::default());
        assert_eq!(order.len(), 3);
        let pos = |c: &CellRef| order.iter().position(|x| x == c).unwrap();
        assert!(pos(&r("B1")) < pos(&r("D1")));
        assert!(pos(&r("C1")) < pos(&r("D1")));
    }

    #[test]
    fn test_topo_order_every_edge_points_forward() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["B1", "A1"]));
        graph.replace_edges(r("D1"), set(&["C1", "B1"]));
        graph.replace_edges(r("E1"), set(&["D1", "A1"]));

        let all = cells(&["B1", "C1", "D1", "E1"]);
        let order = graph.calculation_order(&all, &FxHashSet::default());
        assert_eq!(order.len(), all.len());
        for (i, cell) in order.iter().enumerate() {
            for pred in graph.precedents(cell) {
                if let Some(j) = order.iter().position(|x| x == pred) {
                    assert!(j < i, "{} ordered before its precedent {}", cell, pred);
                }
            }
        }
    }

    #[test]
    fn test_topo_order_deterministic() {
        let mut graph = DepGraph::new();
        for name in ["B3", "B1", "B2"] {
            graph.replace_edges(r(name), set(&["A1"]));
        }
        let all = cells(&["B3", "B1", "B2"]);
        let first = graph.calculation_order(&all, &FxHashSet::default());
        let second = graph.calculation_order(&all, &FxHashSet::default());
        assert_eq!(first, second);
        assert_eq!(first, cells(&["B1", "B2", "B3"]));
    }

    #[test]
    fn test_zero_precedent_cells_are_ordered_first() {
        // A constant formula has no precedents but still needs a slot.
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));

        let order = graph.calculation_order(&cells(&["B1", "K1"]), &FxHashSet::default());
        assert_eq!(order, cells(&["B1", "K1"]));
    }

    #[test]
    fn test_cycle_members_two_node() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("A1"), set(&["B1"]));
        graph.replace_edges(r("B1"), set(&["A1"]));

        let groups = graph.find_cycle_sccs();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], cells(&["A1", "B1"]));
    }

    #[test]
    fn test_cycle_self_loop() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("A1"), set(&["A1"]));

        let groups = graph.find_cycle_sccs();
        assert_eq!(groups, vec![cells(&["A1"])]);
    }

    #[test]
    fn test_cycle_three_node() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("A1"), set(&["C1"]));
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["B1"]));

        let groups = graph.find_cycle_sccs();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], cells(&["A1", "B1", "C1"]));
    }

    #[test]
    fn test_downstream_of_cycle_not_a_member() {
        // A1 <-> B1 cycle; C1 reads A1 but is not in the cycle.
        let mut graph = DepGraph::new();
        graph.replace_edges(r("A1"), set(&["B1"]));
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["A1"]));

        let members: FxHashSet<CellRef> =
            graph.find_cycle_sccs().into_iter().flatten().collect();
        assert_eq!(members, set(&["A1", "B1"]));
    }

    #[test]
    fn test_no_cycles_in_acyclic_graph() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["B1"]));
        assert!(graph.find_cycle_sccs().is_empty());
    }

    #[test]
    fn test_disjoint_cycles_are_separate_groups() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("A1"), set(&["B1"]));
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("X1"), set(&["Y1"]));
        graph.replace_edges(r("Y1"), set(&["X1"]));

        let groups = graph.find_cycle_sccs();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], cells(&["A1", "B1"]));
        assert_eq!(groups[1], cells(&["X1", "Y1"]));
    }

    #[test]
    fn test_skip_excludes_cycle_but_orders_downstream() {
        let mut graph = DepGraph::new();
        graph.replace_edges(r("A1"), set(&["B1"]));
        graph.replace_edges(r("B1"), set(&["A1"]));
        graph.replace_edges(r("C1"), set(&["A1"]));

        let skip = set(&["A1", "B1"]);
        let order = graph.calculation_order(&cells(&["A1", "B1", "C1"]), &skip);
        assert_eq!(order, cells(&["C1"]));
    }

    #[test]
    fn test_cycle_report_messages() {
        let report = CycleReport::self_reference(r("A1"));
        assert!(report.message.contains("references itself"));

        let report = CycleReport::cycle(cells(&["A1", "B1", "C1"]));
        assert!(report.message.contains("->"));
        assert!(!report.message.contains("..."));

        let big: Vec<CellRef> = (0..10).map(|i| r(&format!("A{}", i + 1))).collect();
        let report = CycleReport::cycle(big);
        assert!(report.message.contains("10 cells"));
        assert!(report.message.contains("..."));
    }
}
