//! Query evaluation
//!
//! Evaluation runs in three passes: collect the leaf queries, load every
//! closure they need in one batch per direction, then fold the expression
//! tree with bitmap operators. Where the closures come from is abstracted by
//! [`NodeSource`], so the same evaluator serves live requests and leaderboard
//! snapshots.

use std::collections::HashMap;

use roaring::RoaringBitmap;

use crate::error::{MinefieldError, Result};
use crate::graph::traversal::reachable;
use crate::graph::{Direction, Node, NodeCache};
use crate::query::parser::parse_script;
use crate::query::types::{Expr, Query};
use crate::storage::Storage;

/// Where closures, names and types are read from
pub trait NodeSource {
    fn resolve(&self, name: &str) -> Result<u32>;

    /// Transitive closure of each id, itself included
    fn closures(&self, ids: &[u32], direction: Direction) -> Result<HashMap<u32, RoaringBitmap>>;

    /// Subset of `ids` whose node type is `node_type`
    fn retain_type(&self, ids: &RoaringBitmap, node_type: &str) -> Result<RoaringBitmap>;
}

fn ids_vec(bitmap: &RoaringBitmap) -> Vec<u32> {
    bitmap.iter().collect()
}

fn filter_type<'a>(nodes: impl Iterator<Item = &'a Node>, node_type: &str) -> RoaringBitmap {
    nodes.filter(|n| n.node_type == node_type).map(|n| n.id).collect()
}

// ============================================================================
// Live storage
// ============================================================================

/// Reads straight from storage
///
/// With a coherent cache the closures are single lookups; otherwise each one
/// is a BFS that loads one frontier at a time.
pub struct LiveSource<'a> {
    storage: &'a dyn Storage,
    coherent: bool,
}

impl<'a> LiveSource<'a> {
    pub fn new(storage: &'a dyn Storage) -> Result<Self> {
        let coherent = storage.to_be_cached()?.is_empty();
        Ok(LiveSource { storage, coherent })
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    fn traverse(&self, id: u32, direction: Direction) -> Result<RoaringBitmap> {
        let start: RoaringBitmap = std::iter::once(id).collect();
        reachable(&start, |frontier| {
            let nodes = self.storage.get_nodes(&ids_vec(frontier))?;
            let mut next = RoaringBitmap::new();
            for node in nodes.values() {
                next |= direction.edges(node);
            }
            Ok(next)
        })
    }
}

impl NodeSource for LiveSource<'_> {
    fn resolve(&self, name: &str) -> Result<u32> {
        self.storage.name_to_id(name)
    }

    fn closures(&self, ids: &[u32], direction: Direction) -> Result<HashMap<u32, RoaringBitmap>> {
        if !self.coherent {
            tracing::debug!("Cache is stale, traversing {} start nodes", ids.len());
            return ids
                .iter()
                .map(|&id| -> Result<(u32, RoaringBitmap)> {
                    Ok((id, self.traverse(id, direction)?))
                })
                .collect();
        }

        let mut caches = self.storage.get_caches(ids)?;
        ids.iter()
            .map(|&id| -> Result<(u32, RoaringBitmap)> {
                let cache = caches.remove(&id).ok_or(MinefieldError::CacheNotFound(id))?;
                Ok((id, direction.closure(&cache).clone()))
            })
            .collect()
    }

    fn retain_type(&self, ids: &RoaringBitmap, node_type: &str) -> Result<RoaringBitmap> {
        let nodes = self.storage.get_nodes(&ids_vec(ids))?;
        Ok(filter_type(nodes.values(), node_type))
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Every node and cache loaded up front; read-only and shareable across threads
pub struct Snapshot {
    nodes: HashMap<u32, Node>,
    caches: HashMap<u32, NodeCache>,
    names: HashMap<String, u32>,
}

impl Snapshot {
    pub fn load(storage: &dyn Storage) -> Result<Self> {
        let keys = storage.get_all_keys()?;
        let nodes = storage.get_nodes(&keys)?;
        let caches = storage.get_caches(&keys)?;
        Ok(Self::new(nodes, caches))
    }

    pub fn new(nodes: HashMap<u32, Node>, caches: HashMap<u32, NodeCache>) -> Self {
        let names = nodes.values().map(|n| (n.name.clone(), n.id)).collect();
        Snapshot { nodes, caches, names }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeSource for Snapshot {
    fn resolve(&self, name: &str) -> Result<u32> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| MinefieldError::NameNotFound(name.to_string()))
    }

    fn closures(&self, ids: &[u32], direction: Direction) -> Result<HashMap<u32, RoaringBitmap>> {
        ids.iter()
            .map(|&id| -> Result<(u32, RoaringBitmap)> {
                let cache = self.caches.get(&id).ok_or(MinefieldError::CacheNotFound(id))?;
                Ok((id, direction.closure(cache).clone()))
            })
            .collect()
    }

    fn retain_type(&self, ids: &RoaringBitmap, node_type: &str) -> Result<RoaringBitmap> {
        Ok(filter_type(ids.iter().filter_map(|id| self.nodes.get(&id)), node_type))
    }
}

// ============================================================================
// Evaluation
// ============================================================================

struct Loaded<'q> {
    names: HashMap<&'q str, u32>,
    children: HashMap<u32, RoaringBitmap>,
    parents: HashMap<u32, RoaringBitmap>,
}

impl Loaded<'_> {
    fn closure(&self, name: &str, direction: Direction) -> Result<&RoaringBitmap> {
        let id = *self
            .names
            .get(name)
            .ok_or_else(|| MinefieldError::NameNotFound(name.to_string()))?;
        let closures = match direction {
            Direction::Children => &self.children,
            Direction::Parents => &self.parents,
        };
        closures.get(&id).ok_or(MinefieldError::CacheNotFound(id))
    }
}

fn leaf_name<'q>(query: &'q Query, default_name: Option<&'q str>) -> Result<&'q str> {
    query.resolve_name(default_name).ok_or_else(|| {
        MinefieldError::InvalidQuery(format!("no node name for '{}' and no default given", query))
    })
}

fn fold(
    expr: &Expr,
    source: &dyn NodeSource,
    loaded: &Loaded<'_>,
    default_name: Option<&str>,
) -> Result<RoaringBitmap> {
    match expr {
        Expr::Query(query) => {
            let name = leaf_name(query, default_name)?;
            let closure = loaded.closure(name, query.query_type().direction())?;
            source.retain_type(closure, query.node_type())
        }
        Expr::Group(_, inner) => fold(inner, source, loaded, default_name),
        Expr::Binary { op, lhs, rhs } => {
            let mut acc = fold(lhs, source, loaded, default_name)?;
            let rhs = fold(rhs, source, loaded, default_name)?;
            op.apply(&mut acc, &rhs);
            Ok(acc)
        }
    }
}

/// Evaluate a parsed expression
pub fn execute(expr: &Expr, source: &dyn NodeSource, default_name: Option<&str>) -> Result<RoaringBitmap> {
    let mut names = HashMap::new();
    let mut wanted_children = RoaringBitmap::new();
    let mut wanted_parents = RoaringBitmap::new();

    for query in expr.queries() {
        let name = leaf_name(query, default_name)?;
        let id = match names.get(name) {
            Some(&id) => id,
            None => {
                let id = source.resolve(name)?;
                names.insert(name, id);
                id
            }
        };
        match query.query_type().direction() {
            Direction::Children => wanted_children.insert(id),
            Direction::Parents => wanted_parents.insert(id),
        };
    }

    let loaded = Loaded {
        children: source.closures(&ids_vec(&wanted_children), Direction::Children)?,
        parents: source.closures(&ids_vec(&wanted_parents), Direction::Parents)?,
        names,
    };

    fold(expr, source, &loaded, default_name)
}

/// Parse and evaluate in one step
pub fn parse_and_execute(script: &str, source: &dyn NodeSource, default_name: Option<&str>) -> Result<RoaringBitmap> {
    let expr = parse_script(script)?;
    execute(&expr, source, default_name)
}
