//! Storage contract consumed by the cache builder and query engine

pub mod memory;
pub mod sled_store;

use std::collections::HashMap;

use globset::{Glob, GlobMatcher};

use crate::error::Result;
use crate::graph::{Node, NodeCache};

pub use memory::MemoryStorage;
pub use sled_store::SledStorage;

/// Field map stored under one `(tag, key)` of the custom data space
pub type CustomData = HashMap<String, Vec<u8>>;

/// Persistence backend.
///
/// Implementations do their own locking: reads may run concurrently, writes
/// are serialized. Batch reads omit ids that are missing.
pub trait Storage: Send + Sync {
    // === NODES ===

    /// Fresh id, greater than any previously returned
    fn generate_id(&self) -> Result<u32>;

    /// Persist a node, index its name and mark it stale
    fn save_node(&self, node: &Node) -> Result<()>;

    /// Batch form of `save_node`
    fn save_nodes(&self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            self.save_node(node)?;
        }
        Ok(())
    }

    fn get_node(&self, id: u32) -> Result<Node>;

    fn get_nodes(&self, ids: &[u32]) -> Result<HashMap<u32, Node>>;

    /// Every node id, order unspecified
    fn get_all_keys(&self) -> Result<Vec<u32>>;

    /// Nodes whose name matches a shell-style glob
    fn get_nodes_by_glob(&self, pattern: &str) -> Result<Vec<Node>>;

    fn name_to_id(&self, name: &str) -> Result<u32>;

    // === CACHES ===

    fn save_cache(&self, cache: &NodeCache) -> Result<()>;

    fn save_caches(&self, caches: &[NodeCache]) -> Result<()>;

    fn get_cache(&self, id: u32) -> Result<NodeCache>;

    fn get_caches(&self, ids: &[u32]) -> Result<HashMap<u32, NodeCache>>;

    // === UNCACHED WORKLIST ===

    fn to_be_cached(&self) -> Result<Vec<u32>>;

    fn add_node_to_cached_stack(&self, id: u32) -> Result<()>;

    fn clear_cache_stack(&self) -> Result<()>;

    /// Drop every cache record and put its id back on the worklist
    fn remove_all_caches(&self) -> Result<()>;

    // === CUSTOM DATA ===

    fn add_or_update_custom_data(&self, tag: &str, key: &str, field: &str, data: &[u8]) -> Result<()>;

    /// All fields under `(tag, key)`; empty when nothing was stored
    fn get_custom_data(&self, tag: &str, key: &str) -> Result<CustomData>;
}

/// Compile a name glob. `*` also matches `/`, so `pkg:github/*` covers full PURLs.
pub fn name_matcher(pattern: &str) -> Result<GlobMatcher> {
    Ok(Glob::new(pattern)?.compile_matcher())
}

/// Behaviour every backend must share; each backend's tests call these
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::error::MinefieldError;

    fn node(storage: &dyn Storage, name: &str) -> Node {
        let id = storage.generate_id().unwrap();
        Node::new(id, "library", name, Vec::new())
    }

    pub fn ids_and_nodes(storage: &dyn Storage) {
        let a = storage.generate_id().unwrap();
        let b = storage.generate_id().unwrap();
        assert!(a >= 1);
        assert!(b > a);

        let mut n = Node::new(b, "library", "pkg:npm/left-pad@1.3.0", b"{}".to_vec());
        n.children.insert(a);
        storage.save_node(&n).unwrap();

        assert_eq!(storage.get_node(b).unwrap(), n);
        assert_eq!(storage.name_to_id("pkg:npm/left-pad@1.3.0").unwrap(), b);
        assert!(matches!(storage.get_node(a), Err(MinefieldError::NodeNotFound(_))));
        assert!(matches!(storage.name_to_id("nope"), Err(MinefieldError::NameNotFound(_))));

        let batch = storage.get_nodes(&[a, b]).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_key(&b));

        assert_eq!(storage.get_all_keys().unwrap(), vec![b]);
        assert!(storage.to_be_cached().unwrap().contains(&b));
    }

    pub fn glob(storage: &dyn Storage) {
        let nodes = vec![
            node(storage, "pkg:github/actions/checkout@v3"),
            node(storage, "pkg:github/actions/setup-go@v4"),
            node(storage, "pkg:golang/gopkg.in/yaml.v3@v3.0.1"),
        ];
        storage.save_nodes(&nodes).unwrap();

        let found = storage.get_nodes_by_glob("pkg:github/actions/*").unwrap();
        assert_eq!(found.len(), 2);
        assert!(storage.get_nodes_by_glob("pkg:npm/*").unwrap().is_empty());
        assert!(storage.get_nodes_by_glob("pkg:[").is_err());
    }

    pub fn caches_and_worklist(storage: &dyn Storage) {
        let a = node(storage, "a");
        let b = node(storage, "b");
        storage.save_nodes(&[a.clone(), b.clone()]).unwrap();
        storage.clear_cache_stack().unwrap();
        assert!(storage.to_be_cached().unwrap().is_empty());

        let mut cache = NodeCache::empty(a.id);
        cache.all_children.insert(a.id);
        cache.all_children.insert(b.id);
        storage.save_caches(&[cache.clone(), NodeCache::empty(b.id)]).unwrap();
        assert_eq!(storage.get_cache(a.id).unwrap(), cache);
        assert_eq!(storage.get_caches(&[a.id, b.id, 999]).unwrap().len(), 2);

        storage.add_node_to_cached_stack(a.id).unwrap();
        storage.add_node_to_cached_stack(a.id).unwrap();
        assert!(storage.to_be_cached().unwrap().contains(&a.id));
        storage.clear_cache_stack().unwrap();

        storage.remove_all_caches().unwrap();
        assert!(matches!(storage.get_cache(a.id), Err(MinefieldError::CacheNotFound(_))));
        let stale = storage.to_be_cached().unwrap();
        assert!(stale.contains(&a.id) && stale.contains(&b.id));
    }

    pub fn custom_data(storage: &dyn Storage) {
        assert!(storage.get_custom_data("scorecard", "repo").unwrap().is_empty());

        storage.add_or_update_custom_data("scorecard", "repo", "score", b"7.5").unwrap();
        storage.add_or_update_custom_data("scorecard", "repo", "date", b"2024-01-01").unwrap();
        storage.add_or_update_custom_data("scorecard", "repo", "score", b"8.0").unwrap();
        storage.add_or_update_custom_data("scorecard", "other", "score", b"1").unwrap();

        let data = storage.get_custom_data("scorecard", "repo").unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["score"], b"8.0".to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matcher_spans_slashes() {
        let m = name_matcher("pkg:github/*").unwrap();
        assert!(m.is_match("pkg:github/actions/checkout@v3"));
        assert!(!m.is_match("pkg:golang/gopkg.in/yaml.v3@v3.0.1"));

        let m = name_matcher("pkg:*/yaml.v?@*").unwrap();
        assert!(m.is_match("pkg:golang/gopkg.in/yaml.v3@v3.0.1"));
    }

    #[test]
    fn test_invalid_glob() {
        let err = name_matcher("pkg:[abc").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }
}
