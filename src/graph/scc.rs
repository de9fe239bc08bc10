//! Tarjan's strongly-connected components, iterative
//!
//! Dependency chains in large SBOMs run tens of thousands of nodes deep, so
//! the DFS keeps its own frame stack instead of recursing.

use std::collections::HashMap;

use roaring::RoaringBitmap;

use crate::cancel::CancelToken;
use crate::error::Result;

/// How often the search polls its cancel token, in frames
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Result of an SCC pass over the child-direction graph
#[derive(Debug, Clone, Default)]
pub struct Components {
    /// id -> representative id of its component
    repr: HashMap<u32, u32>,
    /// representative -> members, in discovery order
    members: HashMap<u32, Vec<u32>>,
    /// representatives in completion order (reverse topological order)
    order: Vec<u32>,
}

impl Components {
    pub fn repr(&self, id: u32) -> Option<u32> {
        self.repr.get(&id).copied()
    }

    pub fn same(&self, a: u32, b: u32) -> bool {
        match (self.repr(a), self.repr(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    pub fn members(&self, repr: u32) -> &[u32] {
        self.members.get(&repr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate `(representative, members)` in completion order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u32])> + '_ {
        self.order.iter().map(move |&r| (r, self.members(r)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct Frame {
    id: u32,
    children: Vec<u32>,
    cursor: usize,
}

struct Tarjan {
    known: RoaringBitmap,
    index: HashMap<u32, u32>,
    lowlink: HashMap<u32, u32>,
    on_stack: RoaringBitmap,
    stack: Vec<u32>,
    next_index: u32,
}

impl Tarjan {
    fn enter(&mut self, v: u32, children: Option<&RoaringBitmap>) -> Frame {
        self.index.insert(v, self.next_index);
        self.lowlink.insert(v, self.next_index);
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);

        let children = children
            .map(|bm| bm.iter().filter(|c| self.known.contains(*c)).collect())
            .unwrap_or_default();
        Frame { id: v, children, cursor: 0 }
    }

    fn lower(&mut self, v: u32, candidate: u32) {
        if let Some(low) = self.lowlink.get_mut(&v) {
            *low = (*low).min(candidate);
        }
    }
}

/// Find SCCs over `ids`, following `children`. Child ids outside `ids` are ignored.
///
/// The representative of a component is its DFS root: the member whose index
/// equals its lowlink.
pub fn strongly_connected<'a, F>(
    ids: &[u32],
    mut children: F,
    cancel: &CancelToken,
) -> Result<Components>
where
    F: FnMut(u32) -> Option<&'a RoaringBitmap>,
{
    let mut t = Tarjan {
        known: ids.iter().copied().collect(),
        index: HashMap::with_capacity(ids.len()),
        lowlink: HashMap::with_capacity(ids.len()),
        on_stack: RoaringBitmap::new(),
        stack: Vec::new(),
        next_index: 0,
    };
    let mut out = Components::default();
    let mut steps: usize = 0;

    for &root in ids {
        if t.index.contains_key(&root) {
            continue;
        }

        let mut frames = vec![t.enter(root, children(root))];

        while let Some(frame) = frames.last_mut() {
            steps += 1;
            if steps % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }

            let v = frame.id;
            if frame.cursor < frame.children.len() {
                let w = frame.children[frame.cursor];
                frame.cursor += 1;

                match t.index.get(&w).copied() {
                    None => {
                        let next = t.enter(w, children(w));
                        frames.push(next);
                    }
                    Some(w_index) if t.on_stack.contains(w) => t.lower(v, w_index),
                    Some(_) => {}
                }
                continue;
            }

            // all children explored
            frames.pop();
            let v_low = t.lowlink[&v];
            if let Some(parent) = frames.last() {
                t.lower(parent.id, v_low);
            }

            if v_low == t.index[&v] {
                let mut component = Vec::new();
                while let Some(w) = t.stack.pop() {
                    t.on_stack.remove(w);
                    out.repr.insert(w, v);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.reverse();
                out.members.insert(v, component);
                out.order.push(v);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjacency(edges: &[(u32, u32)]) -> HashMap<u32, RoaringBitmap> {
        let mut adj: HashMap<u32, RoaringBitmap> = HashMap::new();
        for &(a, b) in edges {
            adj.entry(a).or_default().insert(b);
        }
        adj
    }

    fn run(ids: &[u32], edges: &[(u32, u32)]) -> Components {
        let adj = adjacency(edges);
        strongly_connected(ids, |id| adj.get(&id), &CancelToken::none()).unwrap()
    }

    #[test]
    fn test_three_cycle_is_one_component() {
        let c = run(&[1, 2, 3], &[(1, 2), (2, 3), (3, 1)]);
        assert_eq!(c.len(), 1);
        assert!(c.same(1, 2) && c.same(2, 3));
        assert_eq!(c.repr(1), Some(1));
    }

    #[test]
    fn test_dag_has_singletons() {
        let c = run(&[1, 2, 3, 4], &[(1, 2), (1, 3), (2, 4), (3, 4)]);
        assert_eq!(c.len(), 4);
        assert!(!c.same(1, 4));
        // leaves complete first
        assert_eq!(c.iter().next().map(|(r, _)| r), Some(4));
    }

    #[test]
    fn test_two_cycles_joined_by_edge() {
        // {1,2} -> {3,4}
        let c = run(&[1, 2, 3, 4], &[(1, 2), (2, 1), (2, 3), (3, 4), (4, 3)]);
        assert_eq!(c.len(), 2);
        assert!(c.same(1, 2));
        assert!(c.same(3, 4));
        assert!(!c.same(1, 3));
        assert_eq!(c.members(c.repr(3).unwrap()).len(), 2);
    }

    #[test]
    fn test_self_loop_is_singleton() {
        let c = run(&[1, 2], &[(1, 1), (1, 2)]);
        assert_eq!(c.len(), 2);
        assert_eq!(c.members(1), &[1]);
    }

    #[test]
    fn test_unknown_children_ignored() {
        let c = run(&[1], &[(1, 77)]);
        assert_eq!(c.len(), 1);
        assert_eq!(c.repr(77), None);
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let n: u32 = 200_000;
        let ids: Vec<u32> = (1..=n).collect();
        let edges: Vec<(u32, u32)> = (1..n).map(|i| (i, i + 1)).chain([(n, 1)]).collect();
        let c = run(&ids, &edges);
        assert_eq!(c.len(), 1);
        assert_eq!(c.members(c.repr(n).unwrap()).len(), n as usize);
    }

    #[test]
    fn test_cancelled() {
        let ids: Vec<u32> = (1..=5000).collect();
        let adj = adjacency(&(1..5000).map(|i| (i, i + 1)).collect::<Vec<_>>());
        let token = CancelToken::new();
        token.cancel();
        assert!(strongly_connected(&ids, |id| adj.get(&id), &token).is_err());
    }
}
