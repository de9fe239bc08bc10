//! Graph model, closure cache builder and engine façade

pub mod cache;
pub mod engine;
pub mod key_group;
pub mod node;
pub mod scc;
pub mod traversal;

pub use cache::{build_caches, CacheReport};
pub use engine::{GraphEngine, IngestBatch, IngestReport, NewNode, QueryResult};
pub use key_group::KeyGroup;
pub use node::{Node, NodeCache};
pub use scc::{strongly_connected, Components};

use roaring::RoaringBitmap;

/// Edge direction a closure or traversal follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// What a node depends on
    Children,
    /// What depends on a node
    Parents,
}

impl Direction {
    /// Direct neighbors of `node` in this direction
    pub fn edges(self, node: &Node) -> &RoaringBitmap {
        match self {
            Direction::Children => &node.children,
            Direction::Parents => &node.parents,
        }
    }

    /// Closure of `cache` in this direction
    pub fn closure(self, cache: &NodeCache) -> &RoaringBitmap {
        match self {
            Direction::Children => &cache.all_children,
            Direction::Parents => &cache.all_parents,
        }
    }
}
