//! Persistent storage on the sled embedded KV store
//!
//! Trees:
//! - `nodes`    id (u32 BE) -> node JSON wire record
//! - `names`    name -> id
//! - `caches`   id -> cache JSON wire record
//! - `uncached` id -> () (the worklist; a set, so duplicates collapse)
//! - `custom`   tag \0 key -> bincode field map
//! - `meta`     counters

use std::collections::HashMap;
use std::path::Path;

use sled::{Batch, Db, Tree};

use super::{name_matcher, CustomData, Storage};
use crate::error::{MinefieldError, Result};
use crate::graph::{Node, NodeCache};

const LAST_ID_KEY: &[u8] = b"last_id";
const EMPTY: &[u8] = &[];

pub struct SledStorage {
    db: Db,
    nodes: Tree,
    names: Tree,
    caches: Tree,
    uncached: Tree,
    custom: Tree,
    meta: Tree,
}

fn id_key(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

fn key_id(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| MinefieldError::Corrupt(format!("id key of {} bytes", bytes.len())))?;
    Ok(u32::from_be_bytes(raw))
}

fn custom_key(tag: &str, key: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(tag.len() + key.len() + 1);
    k.extend_from_slice(tag.as_bytes());
    k.push(0);
    k.extend_from_slice(key.as_bytes());
    k
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        Ok(Self {
            nodes: db.open_tree("nodes")?,
            names: db.open_tree("names")?,
            caches: db.open_tree("caches")?,
            uncached: db.open_tree("uncached")?,
            custom: db.open_tree("custom")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn generate_id(&self) -> Result<u32> {
        let updated = self.meta.update_and_fetch(LAST_ID_KEY, |old: Option<&[u8]>| {
            let last = old
                .and_then(|v| <[u8; 4]>::try_from(v).ok())
                .map(u32::from_be_bytes)
                .unwrap_or(0);
            Some(last.wrapping_add(1).to_be_bytes().to_vec())
        })?;

        match updated {
            Some(bytes) => key_id(&bytes),
            None => Err(MinefieldError::Corrupt("id counter vanished".into())),
        }
    }

    fn save_node(&self, node: &Node) -> Result<()> {
        self.save_nodes(std::slice::from_ref(node))
    }

    fn save_nodes(&self, nodes: &[Node]) -> Result<()> {
        let mut node_batch = Batch::default();
        let mut name_batch = Batch::default();
        let mut stale_batch = Batch::default();

        for node in nodes {
            let key = id_key(node.id);
            node_batch.insert(&key[..], node.to_json()?);
            name_batch.insert(node.name.as_bytes(), &key[..]);
            stale_batch.insert(&key[..], EMPTY);
        }

        self.nodes.apply_batch(node_batch)?;
        self.names.apply_batch(name_batch)?;
        self.uncached.apply_batch(stale_batch)?;
        Ok(())
    }

    fn get_node(&self, id: u32) -> Result<Node> {
        match self.nodes.get(id_key(id))? {
            Some(bytes) => Node::from_json(&bytes),
            None => Err(MinefieldError::NodeNotFound(id)),
        }
    }

    fn get_nodes(&self, ids: &[u32]) -> Result<HashMap<u32, Node>> {
        let mut out = HashMap::with_capacity(ids.len());
        for &id in ids {
            if let Some(bytes) = self.nodes.get(id_key(id))? {
                out.insert(id, Node::from_json(&bytes)?);
            }
        }
        Ok(out)
    }

    fn get_all_keys(&self) -> Result<Vec<u32>> {
        self.nodes
            .iter()
            .keys()
            .map(|k| key_id(&k?))
            .collect()
    }

    fn get_nodes_by_glob(&self, pattern: &str) -> Result<Vec<Node>> {
        let matcher = name_matcher(pattern)?;
        let mut ids = Vec::new();
        for entry in self.names.iter() {
            let (name, id) = entry?;
            if matcher.is_match(String::from_utf8_lossy(&name).as_ref()) {
                ids.push(key_id(&id)?);
            }
        }

        let mut nodes: Vec<Node> = self.get_nodes(&ids)?.into_values().collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    fn name_to_id(&self, name: &str) -> Result<u32> {
        match self.names.get(name.as_bytes())? {
            Some(bytes) => key_id(&bytes),
            None => Err(MinefieldError::NameNotFound(name.to_string())),
        }
    }

    fn save_cache(&self, cache: &NodeCache) -> Result<()> {
        self.caches.insert(id_key(cache.id), cache.to_json()?)?;
        Ok(())
    }

    fn save_caches(&self, caches: &[NodeCache]) -> Result<()> {
        let mut batch = Batch::default();
        for cache in caches {
            batch.insert(&id_key(cache.id)[..], cache.to_json()?);
        }
        self.caches.apply_batch(batch)?;
        Ok(())
    }

    fn get_cache(&self, id: u32) -> Result<NodeCache> {
        match self.caches.get(id_key(id))? {
            Some(bytes) => NodeCache::from_json(&bytes),
            None => Err(MinefieldError::CacheNotFound(id)),
        }
    }

    fn get_caches(&self, ids: &[u32]) -> Result<HashMap<u32, NodeCache>> {
        let mut out = HashMap::with_capacity(ids.len());
        for &id in ids {
            if let Some(bytes) = self.caches.get(id_key(id))? {
                out.insert(id, NodeCache::from_json(&bytes)?);
            }
        }
        Ok(out)
    }

    fn to_be_cached(&self) -> Result<Vec<u32>> {
        self.uncached
            .iter()
            .keys()
            .map(|k| key_id(&k?))
            .collect()
    }

    fn add_node_to_cached_stack(&self, id: u32) -> Result<()> {
        self.uncached.insert(id_key(id), EMPTY)?;
        Ok(())
    }

    fn clear_cache_stack(&self) -> Result<()> {
        self.uncached.clear()?;
        Ok(())
    }

    fn remove_all_caches(&self) -> Result<()> {
        let mut stale = Batch::default();
        for key in self.caches.iter().keys() {
            stale.insert(key?, EMPTY);
        }
        self.caches.clear()?;
        self.uncached.apply_batch(stale)?;
        Ok(())
    }

    fn add_or_update_custom_data(&self, tag: &str, key: &str, field: &str, data: &[u8]) -> Result<()> {
        let k = custom_key(tag, key);
        let mut fields: CustomData = match self.custom.get(&k)? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => CustomData::new(),
        };
        fields.insert(field.to_string(), data.to_vec());
        self.custom.insert(k, bincode::serialize(&fields)?)?;
        Ok(())
    }

    fn get_custom_data(&self, tag: &str, key: &str) -> Result<CustomData> {
        match self.custom.get(custom_key(tag, key))? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(CustomData::new()),
        }
    }
}
