//! Minefield - supply-chain graph engine with materialized transitive closures
//!
//! # Architecture
//!
//! - **Nodes**: packages, vulnerabilities and scorecards keyed by a dense
//!   `u32` id and a unique name (usually a PURL)
//! - **Edges**: `children` (what a node depends on) and `parents` (what
//!   depends on it), stored as roaring bitmaps
//! - **Closure cache**: per node, every ancestor and descendant; rebuilt in
//!   one pass by condensing cycles (Tarjan) and walking the condensation
//! - **Query DSL**: `dependencies|dependents <type> [<name>]` leaves combined
//!   with `and` / `or` / `xor`
//! - **Leaderboards**: one script evaluated per node on a bounded thread pool
//! - **Storage**: in-memory or sled, behind the [`Storage`] trait
//!
//! # Usage example
//!
//! ```no_run
//! use minefield::{CancelToken, GraphEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = GraphEngine::in_memory();
//!
//! let app = engine.add_node("library", "pkg:github/org/app@v1", Vec::new())?;
//! let lib = engine.add_node("library", "pkg:golang/gopkg.in/yaml.v3@v3.0.1", Vec::new())?;
//! engine.set_dependency(app.id, lib.id)?;
//!
//! engine.cache(&CancelToken::none())?;
//! let result = engine.query("dependents library pkg:golang/gopkg.in/yaml.v3@v3.0.1", None)?;
//! println!("{} dependents", result.ids.len());
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod graph;
pub mod query;
pub mod service;
pub mod storage;

pub use cancel::CancelToken;
pub use error::{ErrorKind, MinefieldError, Result};
pub use graph::{CacheReport, GraphEngine, IngestBatch, IngestReport, NewNode, Node, NodeCache, QueryResult};
pub use query::LeaderboardEntry;
pub use storage::{MemoryStorage, SledStorage, Storage};
