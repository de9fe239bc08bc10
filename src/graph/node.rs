//! Node and cache records with their JSON wire formats
//!
//! Bitmaps travel as base64 of the portable roaring serialization, so the
//! records stay readable by any roaring implementation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{MinefieldError, Result};

/// A package, vulnerability or scorecard in the dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireNode", into = "WireNode")]
pub struct Node {
    pub id: u32,
    pub node_type: String,
    pub name: String,
    /// Opaque to the engine; ingestion stores JSON here
    pub metadata: Vec<u8>,
    /// Ids this node depends on
    pub children: RoaringBitmap,
    /// Ids depending on this node
    pub parents: RoaringBitmap,
}

impl Node {
    pub fn new(id: u32, node_type: impl Into<String>, name: impl Into<String>, metadata: Vec<u8>) -> Self {
        Self {
            id,
            node_type: node_type.into(),
            name: name.into(),
            metadata,
            children: RoaringBitmap::new(),
            parents: RoaringBitmap::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Materialized transitive closures of one node, both including the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireNodeCache", into = "WireNodeCache")]
pub struct NodeCache {
    pub id: u32,
    pub all_parents: RoaringBitmap,
    pub all_children: RoaringBitmap,
}

impl NodeCache {
    /// Fresh cache seeded at AddNode: both closures empty
    pub fn empty(id: u32) -> Self {
        Self {
            id,
            all_parents: RoaringBitmap::new(),
            all_children: RoaringBitmap::new(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serialize a bitmap to the portable roaring format
pub fn bitmap_to_bytes(bitmap: &RoaringBitmap) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(bitmap.serialized_size());
    // Writing into a Vec cannot fail
    let _ = bitmap.serialize_into(&mut bytes);
    bytes
}

pub fn bitmap_from_bytes(bytes: &[u8]) -> Result<RoaringBitmap> {
    RoaringBitmap::deserialize_from(bytes)
        .map_err(|e| MinefieldError::Corrupt(format!("bitmap: {}", e)))
}

fn encode_bitmap(bitmap: &RoaringBitmap) -> String {
    STANDARD.encode(bitmap_to_bytes(bitmap))
}

fn decode_bitmap(data: &str) -> Result<RoaringBitmap> {
    if data.is_empty() {
        return Ok(RoaringBitmap::new());
    }
    bitmap_from_bytes(&STANDARD.decode(data)?)
}

#[derive(Serialize, Deserialize)]
struct WireNode {
    #[serde(rename = "ID")]
    id: u32,
    #[serde(rename = "type")]
    node_type: String,
    name: String,
    #[serde(default)]
    metadata: String,
    #[serde(rename = "childData", default)]
    child_data: String,
    #[serde(rename = "parentData", default)]
    parent_data: String,
}

impl From<Node> for WireNode {
    fn from(node: Node) -> Self {
        WireNode {
            id: node.id,
            child_data: encode_bitmap(&node.children),
            parent_data: encode_bitmap(&node.parents),
            metadata: STANDARD.encode(&node.metadata),
            node_type: node.node_type,
            name: node.name,
        }
    }
}

impl TryFrom<WireNode> for Node {
    type Error = MinefieldError;

    fn try_from(wire: WireNode) -> Result<Self> {
        Ok(Node {
            id: wire.id,
            node_type: wire.node_type,
            name: wire.name,
            metadata: STANDARD.decode(&wire.metadata)?,
            children: decode_bitmap(&wire.child_data)?,
            parents: decode_bitmap(&wire.parent_data)?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct WireNodeCache {
    #[serde(rename = "ID")]
    id: u32,
    #[serde(rename = "allParentsData", default)]
    all_parents_data: String,
    #[serde(rename = "allChildrenData", default)]
    all_children_data: String,
}

impl From<NodeCache> for WireNodeCache {
    fn from(cache: NodeCache) -> Self {
        WireNodeCache {
            id: cache.id,
            all_parents_data: encode_bitmap(&cache.all_parents),
            all_children_data: encode_bitmap(&cache.all_children),
        }
    }
}

impl TryFrom<WireNodeCache> for NodeCache {
    type Error = MinefieldError;

    fn try_from(wire: WireNodeCache) -> Result<Self> {
        Ok(NodeCache {
            id: wire.id,
            all_parents: decode_bitmap(&wire.all_parents_data)?,
            all_children: decode_bitmap(&wire.all_children_data)?,
        })
    }
}
