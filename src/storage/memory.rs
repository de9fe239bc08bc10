//! In-memory storage backend

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{name_matcher, CustomData, Storage};
use crate::error::{MinefieldError, Result};
use crate::graph::{Node, NodeCache};

#[derive(Debug, Default)]
struct Inner {
    last_id: u32,
    nodes: HashMap<u32, Node>,
    names: HashMap<String, u32>,
    caches: HashMap<u32, NodeCache>,
    uncached: Vec<u32>,
    custom: HashMap<(String, String), CustomData>,
}

/// Map-backed storage guarded by a single RwLock
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn generate_id(&self) -> Result<u32> {
        let mut inner = self.write();
        inner.last_id += 1;
        Ok(inner.last_id)
    }

    fn save_node(&self, node: &Node) -> Result<()> {
        let mut inner = self.write();
        inner.names.insert(node.name.clone(), node.id);
        inner.nodes.insert(node.id, node.clone());
        inner.uncached.push(node.id);
        Ok(())
    }

    fn save_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut inner = self.write();
        for node in nodes {
            inner.names.insert(node.name.clone(), node.id);
            inner.nodes.insert(node.id, node.clone());
            inner.uncached.push(node.id);
        }
        Ok(())
    }

    fn get_node(&self, id: u32) -> Result<Node> {
        self.read()
            .nodes
            .get(&id)
            .cloned()
            .ok_or(MinefieldError::NodeNotFound(id))
    }

    fn get_nodes(&self, ids: &[u32]) -> Result<HashMap<u32, Node>> {
        let inner = self.read();
        Ok(ids
            .iter()
            .filter_map(|id| inner.nodes.get(id).map(|n| (*id, n.clone())))
            .collect())
    }

    fn get_all_keys(&self) -> Result<Vec<u32>> {
        Ok(self.read().nodes.keys().copied().collect())
    }

    fn get_nodes_by_glob(&self, pattern: &str) -> Result<Vec<Node>> {
        let matcher = name_matcher(pattern)?;
        let inner = self.read();
        let mut nodes: Vec<Node> = inner
            .nodes
            .values()
            .filter(|n| matcher.is_match(&n.name))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    fn name_to_id(&self, name: &str) -> Result<u32> {
        self.read()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| MinefieldError::NameNotFound(name.to_string()))
    }

    fn save_cache(&self, cache: &NodeCache) -> Result<()> {
        self.write().caches.insert(cache.id, cache.clone());
        Ok(())
    }

    fn save_caches(&self, caches: &[NodeCache]) -> Result<()> {
        let mut inner = self.write();
        for cache in caches {
            inner.caches.insert(cache.id, cache.clone());
        }
        Ok(())
    }

    fn get_cache(&self, id: u32) -> Result<NodeCache> {
        self.read()
            .caches
            .get(&id)
            .cloned()
            .ok_or(MinefieldError::CacheNotFound(id))
    }

    fn get_caches(&self, ids: &[u32]) -> Result<HashMap<u32, NodeCache>> {
        let inner = self.read();
        Ok(ids
            .iter()
            .filter_map(|id| inner.caches.get(id).map(|c| (*id, c.clone())))
            .collect())
    }

    fn to_be_cached(&self) -> Result<Vec<u32>> {
        Ok(self.read().uncached.clone())
    }

    fn add_node_to_cached_stack(&self, id: u32) -> Result<()> {
        self.write().uncached.push(id);
        Ok(())
    }

    fn clear_cache_stack(&self) -> Result<()> {
        self.write().uncached.clear();
        Ok(())
    }

    fn remove_all_caches(&self) -> Result<()> {
        let mut inner = self.write();
        let removed: Vec<u32> = inner.caches.drain().map(|(id, _)| id).collect();
        inner.uncached.extend(removed);
        Ok(())
    }

    fn add_or_update_custom_data(&self, tag: &str, key: &str, field: &str, data: &[u8]) -> Result<()> {
        self.write()
            .custom
            .entry((tag.to_string(), key.to_string()))
            .or_default()
            .insert(field.to_string(), data.to_vec());
        Ok(())
    }

    fn get_custom_data(&self, tag: &str, key: &str) -> Result<CustomData> {
        Ok(self
            .read()
            .custom
            .get(&(tag.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
