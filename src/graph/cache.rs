//! Transitive-closure cache builder
//!
//! Every node gets two bitmaps: all ancestors and all descendants, each
//! including the node itself. Cycles are condensed first (Tarjan), every
//! component is bound to one `KeyGroup` slot, and an iterative DFS over the
//! condensation fills the slots bottom-up. The same pass runs once per
//! direction.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use roaring::RoaringBitmap;

use super::key_group::KeyGroup;
use super::scc::{strongly_connected, Components};
use super::{Direction, Node, NodeCache};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::storage::Storage;

/// How often the DFS polls its cancel token, in frames
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Outcome of a cache rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReport {
    pub nodes: usize,
    pub components: usize,
    pub elapsed: Duration,
}

struct Frame {
    id: u32,
    todo: Vec<u32>,
    cursor: usize,
}

/// Per-component adjacency: union of the members' edges minus the members
fn condensed_edges(
    nodes: &HashMap<u32, Node>,
    comps: &Components,
    known: &RoaringBitmap,
    direction: Direction,
) -> KeyGroup<RoaringBitmap> {
    let mut adjacency = KeyGroup::new();

    for (repr, members) in comps.iter() {
        let member_set: RoaringBitmap = members.iter().copied().collect();
        let mut edges = RoaringBitmap::new();
        for id in members {
            if let Some(node) = nodes.get(id) {
                edges |= direction.edges(node);
            }
        }
        edges -= &member_set;
        edges &= known;

        adjacency.bind(members);
        adjacency.set(repr, edges);
    }

    adjacency
}

/// Closures in the direction `todo` points; `future` is the reverse adjacency
fn closures(
    ids: &[u32],
    comps: &Components,
    todo: &KeyGroup<RoaringBitmap>,
    future: &KeyGroup<RoaringBitmap>,
    cancel: &CancelToken,
) -> Result<KeyGroup<RoaringBitmap>> {
    let repr = |id: u32| comps.repr(id).unwrap_or(id);

    let mut cache: KeyGroup<RoaringBitmap> = KeyGroup::new();
    for (r, members) in comps.iter() {
        cache.bind(members);
        cache.set(r, members.iter().copied().collect());
    }

    // both keyed by representative
    let mut cached = RoaringBitmap::new();
    let mut on_stack = RoaringBitmap::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut steps: usize = 0;

    let frame = |id: u32| -> Result<Frame> {
        Ok(Frame { id, todo: todo.get(id)?.iter().collect(), cursor: 0 })
    };

    for &u in ids {
        let ru = repr(u);
        if cached.contains(ru) {
            continue;
        }
        on_stack.insert(ru);
        stack.push(frame(ru)?);

        while let Some(top) = stack.last_mut() {
            steps += 1;
            if steps % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }

            let v = top.id;
            if cached.contains(v) {
                stack.pop();
                on_stack.remove(v);
                continue;
            }

            if top.cursor == top.todo.len() {
                cached.insert(v);
                stack.pop();
                on_stack.remove(v);

                // dependents become ready once v is done
                for f in future.get(v)?.iter() {
                    let rf = repr(f);
                    if !cached.contains(rf) && !on_stack.contains(rf) {
                        on_stack.insert(rf);
                        stack.push(frame(rf)?);
                    }
                }
                continue;
            }

            let t = top.todo[top.cursor];
            let rt = repr(t);
            if rt == v {
                top.cursor += 1;
            } else if cached.contains(rt) {
                top.cursor += 1;
                cache.union_into(v, rt)?;
                cache.get_mut(v)?.insert(t);
            } else {
                // descend; t is merged when this frame resumes
                on_stack.insert(rt);
                stack.push(frame(rt)?);
            }
        }
    }

    Ok(cache)
}

/// Compute a `NodeCache` for every node in `nodes`
pub fn build_caches(nodes: &HashMap<u32, Node>, cancel: &CancelToken) -> Result<Vec<NodeCache>> {
    build(nodes, cancel).map(|(caches, _)| caches)
}

fn build(nodes: &HashMap<u32, Node>, cancel: &CancelToken) -> Result<(Vec<NodeCache>, usize)> {
    let mut ids: Vec<u32> = nodes.keys().copied().collect();
    ids.sort_unstable();
    let known: RoaringBitmap = ids.iter().copied().collect();

    let comps = strongly_connected(&ids, |id| nodes.get(&id).map(|n| &n.children), cancel)?;

    let children = condensed_edges(nodes, &comps, &known, Direction::Children);
    let parents = condensed_edges(nodes, &comps, &known, Direction::Parents);

    let all_children = closures(&ids, &comps, &children, &parents, cancel)?;
    let all_parents = closures(&ids, &comps, &parents, &children, cancel)?;
    cancel.check()?;

    let mut out = Vec::with_capacity(ids.len());
    for (id, descendants) in all_children.entries() {
        out.push(NodeCache {
            id,
            all_children: descendants.clone(),
            all_parents: all_parents.get(id)?.clone(),
        });
    }

    Ok((out, comps.len()))
}

/// Rebuild every cache when the worklist is non-empty. Returns `None` for a no-op.
///
/// Nothing is written until all closures are computed, so a failed or
/// cancelled rebuild leaves the previous caches and the worklist untouched.
pub fn rebuild<S: Storage + ?Sized>(storage: &S, cancel: &CancelToken) -> Result<Option<CacheReport>> {
    let start = Instant::now();

    if storage.to_be_cached()?.is_empty() {
        tracing::debug!("Cache is coherent, nothing to rebuild");
        return Ok(None);
    }

    let keys = storage.get_all_keys()?;
    let nodes = storage.get_nodes(&keys)?;
    tracing::debug!("Loaded {} nodes in {:?}", nodes.len(), start.elapsed());

    let (caches, components) = build(&nodes, cancel)?;
    cancel.check()?;

    storage.save_caches(&caches)?;
    storage.clear_cache_stack()?;

    let report = CacheReport {
        nodes: caches.len(),
        components,
        elapsed: start.elapsed(),
    };
    tracing::info!(
        "Cached {} nodes ({} components) in {:?}",
        report.nodes,
        report.components,
        report.elapsed
    );
    Ok(Some(report))
}

/// Drop every cache; all nodes go back on the worklist
pub fn clear<S: Storage + ?Sized>(storage: &S) -> Result<()> {
    storage.remove_all_caches()?;
    tracing::info!("Caches cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::traversal::reachable;
    use crate::storage::MemoryStorage;

    /// Build an in-memory node map from an edge list (`from` depends on `to`)
    fn graph(n: u32, edges: &[(u32, u32)]) -> HashMap<u32, Node> {
        let mut nodes: HashMap<u32, Node> = (1..=n)
            .map(|id| (id, Node::new(id, "library", format!("n{}", id), Vec::new())))
            .collect();
        for &(from, to) in edges {
            nodes.get_mut(&from).unwrap().children.insert(to);
            nodes.get_mut(&to).unwrap().parents.insert(from);
        }
        nodes
    }

    fn by_id(caches: Vec<NodeCache>) -> HashMap<u32, NodeCache> {
        caches.into_iter().map(|c| (c.id, c)).collect()
    }

    fn bitmap(ids: &[u32]) -> RoaringBitmap {
        ids.iter().copied().collect()
    }

    fn bfs(nodes: &HashMap<u32, Node>, id: u32, direction: Direction) -> RoaringBitmap {
        reachable(&bitmap(&[id]), |frontier| {
            let mut next = RoaringBitmap::new();
            for v in frontier {
                next |= direction.edges(&nodes[&v]);
            }
            Ok(next)
        })
        .unwrap()
    }

    #[test]
    fn test_single_node() {
        let nodes = graph(1, &[]);
        let caches = by_id(build_caches(&nodes, &CancelToken::none()).unwrap());

        assert_eq!(caches[&1].all_children, bitmap(&[1]));
        assert_eq!(caches[&1].all_parents, bitmap(&[1]));
    }

    #[test]
    fn test_three_cycle() {
        let nodes = graph(3, &[(1, 2), (2, 3), (3, 1)]);
        let caches = by_id(build_caches(&nodes, &CancelToken::none()).unwrap());

        for id in 1..=3 {
            assert_eq!(caches[&id].all_children, bitmap(&[1, 2, 3]));
            assert_eq!(caches[&id].all_parents, bitmap(&[1, 2, 3]));
        }
    }

    #[test]
    fn test_diamond() {
        // 1 -> {2, 3} -> 4
        let nodes = graph(4, &[(1, 2), (1, 3), (2, 4), (3, 4)]);
        let caches = by_id(build_caches(&nodes, &CancelToken::none()).unwrap());

        assert_eq!(caches[&1].all_children, bitmap(&[1, 2, 3, 4]));
        assert_eq!(caches[&2].all_children, bitmap(&[2, 4]));
        assert_eq!(caches[&4].all_children, bitmap(&[4]));
        assert_eq!(caches[&4].all_parents, bitmap(&[1, 2, 3, 4]));
        assert_eq!(caches[&1].all_parents, bitmap(&[1]));
    }

    #[test]
    fn test_cycle_feeding_chain() {
        // 1 -> 2 <-> 3 -> 4 -> 5, plus 6 -> 3
        let nodes = graph(6, &[(1, 2), (2, 3), (3, 2), (3, 4), (4, 5), (6, 3)]);
        let caches = by_id(build_caches(&nodes, &CancelToken::none()).unwrap());

        assert_eq!(caches[&2].all_children, caches[&3].all_children);
        assert_eq!(caches[&2].all_parents, caches[&3].all_parents);
        assert_eq!(caches[&2].all_children, bitmap(&[2, 3, 4, 5]));
        assert_eq!(caches[&5].all_parents, bitmap(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(caches[&6].all_children, bitmap(&[2, 3, 4, 5, 6]));
    }

    #[test]
    fn test_closures_match_traversal() {
        // layered graph with back edges and shared dependents
        let n = 60;
        let mut edges = Vec::new();
        for i in 1..=n {
            for step in [1, 7, 13] {
                let j = i + step;
                if j <= n {
                    edges.push((i, j));
                }
            }
            if i % 10 == 0 {
                edges.push((i, i - 9));
            }
        }
        let nodes = graph(n, &edges);
        let caches = by_id(build_caches(&nodes, &CancelToken::none()).unwrap());

        for id in 1..=n {
            let cache = &caches[&id];
            assert_eq!(cache.all_children, bfs(&nodes, id, Direction::Children), "children of {}", id);
            assert_eq!(cache.all_parents, bfs(&nodes, id, Direction::Parents), "parents of {}", id);
            assert!(cache.all_children.contains(id));
            assert!(cache.all_parents.contains(id));
            assert!(nodes[&id].children.is_subset(&cache.all_children));
            assert!(nodes[&id].parents.is_subset(&cache.all_parents));
        }
    }

    #[test]
    fn test_edges_to_unknown_nodes_ignored() {
        let mut nodes = graph(2, &[(1, 2)]);
        nodes.get_mut(&2).unwrap().children.insert(99);
        let caches = by_id(build_caches(&nodes, &CancelToken::none()).unwrap());

        assert_eq!(caches[&1].all_children, bitmap(&[1, 2]));
    }

    #[test]
    fn test_rebuild_noop_when_coherent() {
        let storage = MemoryStorage::new();
        assert!(rebuild(&storage, &CancelToken::none()).unwrap().is_none());
    }

    #[test]
    fn test_rebuild_saves_and_clears_worklist() {
        let storage = MemoryStorage::new();
        let mut a = Node::new(storage.generate_id().unwrap(), "library", "a", Vec::new());
        let mut b = Node::new(storage.generate_id().unwrap(), "library", "b", Vec::new());
        a.children.insert(b.id);
        b.parents.insert(a.id);
        storage.save_nodes(&[a.clone(), b.clone()]).unwrap();

        let report = rebuild(&storage, &CancelToken::none()).unwrap().unwrap();
        assert_eq!(report.nodes, 2);
        assert_eq!(report.components, 2);
        assert!(storage.to_be_cached().unwrap().is_empty());
        assert_eq!(storage.get_cache(a.id).unwrap().all_children, bitmap(&[a.id, b.id]));

        clear(&storage).unwrap();
        assert_eq!(storage.to_be_cached().unwrap().len(), 2);
    }

    #[test]
    fn test_cancelled_rebuild_leaves_worklist() {
        let storage = MemoryStorage::new();
        let id = storage.generate_id().unwrap();
        storage.save_node(&Node::new(id, "library", "a", Vec::new())).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            rebuild(&storage, &cancel),
            Err(crate::error::MinefieldError::Cancelled)
        ));
        assert_eq!(storage.to_be_cached().unwrap(), vec![id]);
        assert!(storage.get_cache(id).is_err());
    }
}
