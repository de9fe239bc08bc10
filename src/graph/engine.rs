//! GraphEngine: the write and query façade over a storage backend
//!
//! Storage backends serialize their own writes, but graph mutations are
//! read-modify-write sequences spanning several nodes (and the cache
//! rebuild snapshots the whole graph), so the engine runs them one at a
//! time behind a write gate. Reads never take the gate.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use roaring::RoaringBitmap;

use super::cache::{self, CacheReport};
use super::{Node, NodeCache};
use crate::cancel::CancelToken;
use crate::error::{MinefieldError, Result};
use crate::query::eval::{parse_and_execute, LiveSource};
use crate::query::leaderboard::{self, LeaderboardEntry};
use crate::storage::{CustomData, MemoryStorage, Storage};

/// Node to create during ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub node_type: String,
    pub name: String,
    pub metadata: Vec<u8>,
}

impl NewNode {
    pub fn new(node_type: &str, name: &str, metadata: Vec<u8>) -> Self {
        NewNode {
            node_type: node_type.to_string(),
            name: name.to_string(),
            metadata,
        }
    }
}

/// Nodes plus name-to-name dependency edges (`from` depends on `to`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestBatch {
    pub nodes: Vec<NewNode>,
    pub edges: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub nodes_added: usize,
    pub edges_added: usize,
    /// Edges naming an unknown node, or a node and itself
    pub skipped_edges: Vec<(String, String)>,
}

/// Evaluated query: the id set and its nodes in id order
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub ids: RoaringBitmap,
    pub nodes: Vec<Node>,
}

pub struct GraphEngine {
    storage: Arc<dyn Storage>,
    write_gate: Mutex<()>,
}

impl GraphEngine {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            write_gate: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // === NODE OPERATIONS ===

    /// Create a node, or return the existing one if `name` is taken
    pub fn add_node(&self, node_type: &str, name: &str, metadata: Vec<u8>) -> Result<Node> {
        let _gate = self.lock_writes();
        self.insert_node(node_type, name, metadata).map(|(node, _)| node)
    }

    fn lookup(&self, name: &str) -> Result<Option<u32>> {
        match self.storage.name_to_id(name) {
            Ok(id) => Ok(Some(id)),
            Err(MinefieldError::NameNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Caller holds the write gate. The flag is true for a new node.
    fn insert_node(&self, node_type: &str, name: &str, metadata: Vec<u8>) -> Result<(Node, bool)> {
        if let Some(id) = self.lookup(name)? {
            return Ok((self.storage.get_node(id)?, false));
        }

        let id = self.storage.generate_id()?;
        let node = Node::new(id, node_type, name, metadata);
        self.storage.save_node(&node)?;
        self.storage.save_cache(&NodeCache::empty(id))?;
        tracing::debug!("Added node {} ({}) as {}", name, node_type, id);
        Ok((node, true))
    }

    pub fn get_node(&self, id: u32) -> Result<Node> {
        self.storage.get_node(id)
    }

    pub fn get_node_by_name(&self, name: &str) -> Result<Node> {
        let id = self.storage.name_to_id(name)?;
        self.storage.get_node(id)
    }

    pub fn get_nodes_by_glob(&self, pattern: &str) -> Result<Vec<Node>> {
        self.storage.get_nodes_by_glob(pattern)
    }

    /// Every node, in id order
    pub fn all_nodes(&self) -> Result<Vec<Node>> {
        let keys = self.storage.get_all_keys()?;
        let mut nodes: Vec<Node> = self.storage.get_nodes(&keys)?.into_values().collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    // === EDGE OPERATIONS ===

    /// Record that `from` depends on `to`.
    ///
    /// Both nodes go back on the uncached worklist only when the edge is new.
    /// Re-adding an existing edge leaves the closures unchanged, so neither
    /// node is marked stale and a coherent cache stays coherent.
    pub fn set_dependency(&self, from: u32, to: u32) -> Result<()> {
        if from == to {
            return Err(MinefieldError::SelfDependency(from));
        }
        let _gate = self.lock_writes();
        self.link(&[(from, to)])?;
        Ok(())
    }

    /// Apply many edges at once; self-edges are dropped. Returns the number
    /// of edges that did not exist before.
    pub fn add_dependencies(&self, edges: &[(u32, u32)]) -> Result<usize> {
        let _gate = self.lock_writes();
        self.link(edges)
    }

    /// Caller holds the write gate. Only nodes whose edge sets actually
    /// change are saved, so re-adding known edges keeps the cache coherent.
    fn link(&self, edges: &[(u32, u32)]) -> Result<usize> {
        let mut touched = RoaringBitmap::new();
        for &(from, to) in edges {
            if from != to {
                touched.insert(from);
                touched.insert(to);
            }
        }

        let ids: Vec<u32> = touched.iter().collect();
        let mut nodes = self.storage.get_nodes(&ids)?;
        if let Some(missing) = ids.iter().find(|id| !nodes.contains_key(*id)) {
            return Err(MinefieldError::NodeNotFound(*missing));
        }

        let mut changed = RoaringBitmap::new();
        let mut added = 0;
        for &(from, to) in edges {
            if from == to {
                tracing::debug!("Dropping self-dependency on {}", from);
                continue;
            }
            let new_child = nodes.get_mut(&from).is_some_and(|n| n.children.insert(to));
            let new_parent = nodes.get_mut(&to).is_some_and(|n| n.parents.insert(from));
            if new_child || new_parent {
                added += 1;
                changed.insert(from);
                changed.insert(to);
            }
        }

        let dirty: Vec<Node> = changed.iter().filter_map(|id| nodes.remove(&id)).collect();
        self.storage.save_nodes(&dirty)?;
        Ok(added)
    }

    // === INGESTION ===

    /// Create nodes and resolve name edges in one write-gated step
    pub fn ingest(&self, batch: IngestBatch) -> Result<IngestReport> {
        let _gate = self.lock_writes();
        let mut report = IngestReport::default();

        for spec in batch.nodes {
            let (_, created) = self.insert_node(&spec.node_type, &spec.name, spec.metadata)?;
            if created {
                report.nodes_added += 1;
            }
        }

        let mut resolved = Vec::with_capacity(batch.edges.len());
        for (from, to) in batch.edges {
            match (self.lookup(&from)?, self.lookup(&to)?) {
                (Some(a), Some(b)) if a != b => resolved.push((a, b)),
                _ => {
                    tracing::warn!("Skipping edge {} -> {}", from, to);
                    report.skipped_edges.push((from, to));
                }
            }
        }
        report.edges_added = self.link(&resolved)?;

        tracing::info!(
            "Ingested {} nodes, {} edges ({} skipped)",
            report.nodes_added,
            report.edges_added,
            report.skipped_edges.len()
        );
        Ok(report)
    }

    // === CACHE ===

    /// True when no node is waiting for a cache rebuild
    pub fn is_coherent(&self) -> Result<bool> {
        Ok(self.storage.to_be_cached()?.is_empty())
    }

    /// Rebuild closures if anything changed; `None` when already coherent
    pub fn cache(&self, cancel: &CancelToken) -> Result<Option<CacheReport>> {
        let _gate = self.lock_writes();
        cache::rebuild(self.storage.as_ref(), cancel)
    }

    pub fn clear(&self) -> Result<()> {
        let _gate = self.lock_writes();
        cache::clear(self.storage.as_ref())
    }

    // === QUERIES ===

    /// Evaluate a script; leaves without a node name use `default_name`
    pub fn query(&self, script: &str, default_name: Option<&str>) -> Result<QueryResult> {
        let source = LiveSource::new(self.storage.as_ref())?;
        let ids = parse_and_execute(script, &source, default_name)?;

        let wanted: Vec<u32> = ids.iter().collect();
        let mut nodes: Vec<Node> = self.storage.get_nodes(&wanted)?.into_values().collect();
        nodes.sort_by_key(|n| n.id);
        Ok(QueryResult { ids, nodes })
    }

    pub fn leaderboard(
        &self,
        script: &str,
        limit: Option<usize>,
        concurrency: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<LeaderboardEntry>> {
        leaderboard::run(self.storage.as_ref(), script, limit, concurrency, cancel)
    }

    // === CUSTOM DATA ===

    pub fn add_or_update_custom_data(&self, tag: &str, key: &str, field: &str, data: &[u8]) -> Result<()> {
        self.storage.add_or_update_custom_data(tag, key, field, data)
    }

    pub fn get_custom_data(&self, tag: &str, key: &str) -> Result<CustomData> {
        self.storage.get_custom_data(tag, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SledStorage;
    use tempfile::tempdir;

    fn bitmap(ids: &[u32]) -> RoaringBitmap {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_add_node_is_idempotent_by_name() {
        let engine = GraphEngine::in_memory();

        let a = engine.add_node("library", "pkg:npm/a@1", b"{}".to_vec()).unwrap();
        let again = engine.add_node("vuln", "pkg:npm/a@1", Vec::new()).unwrap();

        assert_eq!(a, again);
        assert_eq!(engine.all_nodes().unwrap().len(), 1);
        assert_eq!(engine.storage().get_cache(a.id).unwrap(), NodeCache::empty(a.id));
        assert!(!engine.is_coherent().unwrap());
    }

    #[test]
    fn test_set_dependency_updates_both_sides() {
        let engine = GraphEngine::in_memory();
        let a = engine.add_node("library", "a", Vec::new()).unwrap();
        let b = engine.add_node("library", "b", Vec::new()).unwrap();

        engine.set_dependency(a.id, b.id).unwrap();

        assert_eq!(engine.get_node(a.id).unwrap().children, bitmap(&[b.id]));
        assert_eq!(engine.get_node(b.id).unwrap().parents, bitmap(&[a.id]));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let engine = GraphEngine::in_memory();
        let a = engine.add_node("library", "a", Vec::new()).unwrap();

        let err = engine.set_dependency(a.id, a.id).unwrap_err();
        assert!(matches!(err, MinefieldError::SelfDependency(id) if id == a.id));
        assert!(engine.get_node(a.id).unwrap().children.is_empty());
    }

    #[test]
    fn test_dependency_on_missing_node() {
        let engine = GraphEngine::in_memory();
        let a = engine.add_node("library", "a", Vec::new()).unwrap();

        assert!(matches!(
            engine.set_dependency(a.id, 42),
            Err(MinefieldError::NodeNotFound(42))
        ));
    }

    #[test]
    fn test_known_edge_keeps_cache_coherent() {
        let engine = GraphEngine::in_memory();
        let a = engine.add_node("library", "a", Vec::new()).unwrap();
        let b = engine.add_node("library", "b", Vec::new()).unwrap();
        engine.set_dependency(a.id, b.id).unwrap();
        engine.cache(&CancelToken::none()).unwrap();
        assert!(engine.is_coherent().unwrap());

        assert_eq!(engine.add_dependencies(&[(a.id, b.id), (a.id, a.id)]).unwrap(), 0);
        assert!(engine.is_coherent().unwrap());
        engine.set_dependency(a.id, b.id).unwrap();
        assert!(engine.is_coherent().unwrap());

        let c = engine.add_node("library", "c", Vec::new()).unwrap();
        assert!(!engine.is_coherent().unwrap());
        assert_eq!(engine.add_dependencies(&[(b.id, c.id)]).unwrap(), 1);
    }

    #[test]
    fn test_ingest_reports_skipped_edges() {
        let engine = GraphEngine::in_memory();
        engine.add_node("library", "existing", Vec::new()).unwrap();

        let report = engine
            .ingest(IngestBatch {
                nodes: vec![
                    NewNode::new("library", "app", Vec::new()),
                    NewNode::new("library", "lib", Vec::new()),
                    NewNode::new("library", "existing", Vec::new()),
                ],
                edges: vec![
                    ("app".into(), "lib".into()),
                    ("app".into(), "existing".into()),
                    ("app".into(), "ghost".into()),
                    ("lib".into(), "lib".into()),
                ],
            })
            .unwrap();

        assert_eq!(report.nodes_added, 2);
        assert_eq!(report.edges_added, 2);
        assert_eq!(
            report.skipped_edges,
            vec![("app".to_string(), "ghost".to_string()), ("lib".to_string(), "lib".to_string())]
        );
        assert_eq!(engine.get_node_by_name("app").unwrap().children.len(), 2);
    }

    #[test]
    fn test_query_same_before_and_after_cache() {
        let engine = GraphEngine::in_memory();
        let app = engine.add_node("library", "app", Vec::new()).unwrap();
        let lib = engine.add_node("library", "lib", Vec::new()).unwrap();
        let vuln = engine.add_node("vuln", "GHSA-1", Vec::new()).unwrap();
        engine.add_dependencies(&[(app.id, lib.id), (lib.id, vuln.id)]).unwrap();

        let stale = engine.query("dependencies vuln app", None).unwrap();
        engine.cache(&CancelToken::none()).unwrap();
        let cached = engine.query("dependencies vuln app", None).unwrap();

        assert_eq!(stale.ids, bitmap(&[vuln.id]));
        assert_eq!(stale.ids, cached.ids);
        assert_eq!(cached.nodes, vec![engine.get_node(vuln.id).unwrap()]);
        assert_eq!(cached.nodes[0].parents, bitmap(&[lib.id]));
    }

    #[test]
    fn test_clear_then_recache() {
        let engine = GraphEngine::in_memory();
        let a = engine.add_node("library", "a", Vec::new()).unwrap();
        let b = engine.add_node("library", "b", Vec::new()).unwrap();
        engine.set_dependency(a.id, b.id).unwrap();

        let report = engine.cache(&CancelToken::none()).unwrap().unwrap();
        assert_eq!(report.nodes, 2);
        assert!(engine.cache(&CancelToken::none()).unwrap().is_none());

        engine.clear().unwrap();
        assert!(!engine.is_coherent().unwrap());
        assert!(engine.storage().get_cache(a.id).is_err());

        engine.cache(&CancelToken::none()).unwrap();
        assert_eq!(engine.storage().get_cache(a.id).unwrap().all_children, bitmap(&[a.id, b.id]));
    }

    #[test]
    fn test_custom_data_passthrough() {
        let engine = GraphEngine::in_memory();
        engine.add_or_update_custom_data("scorecard", "repo", "score", b"9").unwrap();
        assert_eq!(engine.get_custom_data("scorecard", "repo").unwrap()["score"], b"9".to_vec());
    }

    #[test]
    fn test_sled_backed_engine_persists_caches() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("graph.db");

        {
            let storage = Arc::new(SledStorage::open(&path).unwrap());
            let engine = GraphEngine::new(storage.clone());
            let a = engine.add_node("library", "a", Vec::new()).unwrap();
            let b = engine.add_node("library", "b", Vec::new()).unwrap();
            engine.set_dependency(a.id, b.id).unwrap();
            engine.cache(&CancelToken::none()).unwrap();
            storage.flush().unwrap();
        }

        let engine = GraphEngine::new(Arc::new(SledStorage::open(&path).unwrap()));
        assert!(engine.is_coherent().unwrap());
        let result = engine.query("dependents library b", None).unwrap();
        assert_eq!(result.ids.len(), 2);
    }
}
