//! Update Scheduler
//!
//! The scheduler determines the order in which dependents of a changed cell
//! are recomputed. It ensures that dependencies are always recomputed before
//! their dependents, and that each cell is visited once.
//!
//! # Algorithm
//!
//! We use a depth-first topological sort starting from the changed cell:
//!
//! 1. Visit a cell, mark it, then visit each of its dependents
//! 2. Once every dependent has been visited, append the cell to the order
//! 3. Read the resulting list back to front
//!
//! The changed cell is the only root, so no in-degree bookkeeping is needed.
//! The walk does not look for cycles: marking keeps a cyclic graph from
//! looping, but the order it produces for one is unspecified.
//!
//! The walk uses an explicit stack rather than recursion, so deep dependency
//! chains cannot exhaust the call stack.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::node::CellId;

/// Dependents of a single cell, as reported by the caller.
pub(crate) type Dependents = SmallVec<[CellId; 4]>;

/// Compute the recompute order for everything reachable from `root`.
///
/// `dependents_of` reports the dependents of a cell. The returned list is in
/// post-order: iterate it in reverse to get dependencies before dependents.
/// `root` is always the last element.
pub(crate) fn topological_order<F>(root: CellId, mut dependents_of: F) -> Vec<CellId>
where
    F: FnMut(CellId) -> Dependents,
{
    let mut order = Vec::new();
    let mut marked = FxHashSet::default();
    let mut stack: Vec<(CellId, smallvec::IntoIter<[CellId; 4]>)> = Vec::new();

    marked.insert(root);
    stack.push((root, dependents_of(root).into_iter()));

    loop {
        let Some((node, children)) = stack.last_mut() else {
            break;
        };
        let node = *node;

        match children.next() {
            Some(next) => {
                // A reflexive self-dependency is not an edge.
                if next != node && marked.insert(next) {
                    let grandchildren = dependents_of(next);
                    stack.push((next, grandchildren.into_iter()));
                }
            }
            None => {
                order.push(node);
                stack.pop();
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;
    use smallvec::smallvec;

    fn graph(edges: &[(CellId, CellId)]) -> FxHashMap<CellId, Dependents> {
        let mut map: FxHashMap<CellId, Dependents> = FxHashMap::default();
        for (from, to) in edges {
            map.entry(*from).or_default().push(*to);
        }
        map
    }

    fn position(order: &[CellId], id: CellId) -> usize {
        // Positions are reported in forward topological order.
        order.len() - 1 - order.iter().position(|&other| other == id).unwrap()
    }

    #[test]
    fn single_cell_orders_itself() {
        let root = CellId::new();
        let order = topological_order(root, |_| SmallVec::new());
        assert_eq!(order, vec![root]);
    }

    #[test]
    fn chain_is_ordered_dependencies_first() {
        // Create a chain: source -> derived1 -> derived2
        let source = CellId::new();
        let derived1 = CellId::new();
        let derived2 = CellId::new();
        let edges = graph(&[(source, derived1), (derived1, derived2)]);

        let order = topological_order(source, |id| edges.get(&id).cloned().unwrap_or_default());

        assert_eq!(order.len(), 3);
        assert_eq!(*order.last().unwrap(), source);
        assert!(position(&order, derived1) < position(&order, derived2));
    }

    #[test]
    fn diamond_visits_shared_dependent_once() {
        let value = CellId::new();
        let left = CellId::new();
        let right = CellId::new();
        let bottom = CellId::new();
        let edges = graph(&[(value, left), (value, right), (left, bottom), (right, bottom)]);

        let mut visits = 0;
        let order = topological_order(value, |id| {
            visits += 1;
            edges.get(&id).cloned().unwrap_or_default()
        });

        assert_eq!(order.len(), 4);
        assert_eq!(visits, 4);
        assert!(position(&order, left) < position(&order, bottom));
        assert!(position(&order, right) < position(&order, bottom));
    }

    #[test]
    fn reflexive_edges_are_ignored() {
        let root = CellId::new();
        let child = CellId::new();
        let order = topological_order(root, |id| {
            if id == root {
                smallvec![root, child]
            } else {
                smallvec![child]
            }
        });
        assert_eq!(order, vec![child, root]);
    }

    #[test]
    fn cycles_terminate() {
        let a = CellId::new();
        let b = CellId::new();
        let order = topological_order(a, |id| if id == a { smallvec![b] } else { smallvec![a] });
        assert_eq!(order.len(), 2);
    }
}
