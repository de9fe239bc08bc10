//! MessagePack request/response protocol over the graph engine
//!
//! Frames on the wire:
//!
//! ```text
//! Request:  [4-byte length BE] [MessagePack payload]
//! Response: [4-byte length BE] [MessagePack payload]
//! ```
//!
//! Requests are maps tagged by `cmd`. Responses are untagged maps; failures
//! carry `error` and `kind`.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, MinefieldError, Result};
use crate::graph::{GraphEngine, IngestBatch, IngestReport, NewNode, Node};
use crate::query::LeaderboardEntry;

/// Largest accepted frame
pub const MAX_FRAME: usize = 100 * 1024 * 1024;

pub const SERVICE_VERSION: &str = "v1";

// ============================================================================
// Wire Protocol Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    // Writes
    AddNodes {
        nodes: Vec<WireNewNode>,
        #[serde(default)]
        edges: Vec<WireEdge>,
    },
    AddDependencies { edges: Vec<WireEdge> },
    Cache,
    Clear,

    // Reads
    GetNode { id: u32 },
    GetNodeByName { name: String },
    GetNodesByGlob { pattern: String },
    AllKeys,
    Query {
        script: String,
        #[serde(default, rename = "defaultNodeName")]
        default_node_name: Option<String>,
    },
    CustomLeaderboard {
        script: String,
        #[serde(default)]
        limit: Option<usize>,
    },

    // Control
    Check,
    Shutdown,
}

/// Node to create; metadata is passed through as UTF-8 text
#[derive(Debug, Serialize, Deserialize)]
pub struct WireNewNode {
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub metadata: String,
}

/// Dependency by name: `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLeaderboardEntry {
    pub node: Node,
    pub output_ids: Vec<u32>,
}

impl From<LeaderboardEntry> for WireLeaderboardEntry {
    fn from(entry: LeaderboardEntry) -> Self {
        WireLeaderboardEntry {
            node: entry.node,
            output_ids: entry.output.iter().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        ok: bool,
    },
    Error {
        error: String,
        kind: String,
    },
    Node {
        node: Node,
    },
    Nodes {
        nodes: Vec<Node>,
    },
    Leaderboard {
        #[serde(rename = "serviceVersion")]
        service_version: String,
        entries: Vec<WireLeaderboardEntry>,
    },
    Status {
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    Ingested {
        nodes_added: usize,
        edges_added: usize,
        skipped_edges: Vec<WireEdge>,
    },
}

impl Response {
    fn error(message: String, kind: ErrorKind) -> Self {
        Response::Error {
            error: message,
            kind: kind.as_str().to_string(),
        }
    }
}

impl From<MinefieldError> for Response {
    fn from(e: MinefieldError) -> Self {
        Response::error(e.to_string(), e.kind())
    }
}

impl From<IngestReport> for Response {
    fn from(report: IngestReport) -> Self {
        Response::Ingested {
            nodes_added: report.nodes_added,
            edges_added: report.edges_added,
            skipped_edges: report
                .skipped_edges
                .into_iter()
                .map(|(from, to)| WireEdge { from, to })
                .collect(),
        }
    }
}

fn edge_pairs(edges: Vec<WireEdge>) -> Vec<(String, String)> {
    edges.into_iter().map(|e| (e.from, e.to)).collect()
}

// ============================================================================
// Request Handling
// ============================================================================

/// Shared per-process request handler
pub struct Service {
    engine: Arc<GraphEngine>,
    concurrency: usize,
    cancel: CancelToken,
    shutdown: Arc<AtomicBool>,
}

impl Service {
    pub fn new(engine: Arc<GraphEngine>, concurrency: usize, cancel: CancelToken, shutdown: Arc<AtomicBool>) -> Self {
        Service {
            engine,
            concurrency: concurrency.max(1),
            cancel,
            shutdown,
        }
    }

    pub fn engine(&self) -> &GraphEngine {
        &self.engine
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn handle(&self, request: Request) -> Response {
        self.dispatch(request).unwrap_or_else(Response::from)
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        let engine = &self.engine;

        match request {
            Request::AddNodes { nodes, edges } => {
                let batch = IngestBatch {
                    nodes: nodes
                        .into_iter()
                        .map(|n| NewNode {
                            node_type: n.node_type,
                            name: n.name,
                            metadata: n.metadata.into_bytes(),
                        })
                        .collect(),
                    edges: edge_pairs(edges),
                };
                Ok(engine.ingest(batch)?.into())
            }

            Request::AddDependencies { edges } => {
                let batch = IngestBatch {
                    nodes: Vec::new(),
                    edges: edge_pairs(edges),
                };
                Ok(engine.ingest(batch)?.into())
            }

            Request::Cache => {
                engine.cache(&self.cancel)?;
                Ok(Response::Ok { ok: true })
            }

            Request::Clear => {
                engine.clear()?;
                Ok(Response::Ok { ok: true })
            }

            Request::GetNode { id } => Ok(Response::Node {
                node: engine.get_node(id)?,
            }),

            Request::GetNodeByName { name } => Ok(Response::Node {
                node: engine.get_node_by_name(&name)?,
            }),

            Request::GetNodesByGlob { pattern } => Ok(Response::Nodes {
                nodes: engine.get_nodes_by_glob(&pattern)?,
            }),

            Request::AllKeys => Ok(Response::Nodes {
                nodes: engine.all_nodes()?,
            }),

            Request::Query {
                script,
                default_node_name,
            } => {
                let result = engine.query(&script, default_node_name.as_deref())?;
                Ok(Response::Nodes { nodes: result.nodes })
            }

            Request::CustomLeaderboard { script, limit } => {
                let entries = engine.leaderboard(&script, limit, self.concurrency, &self.cancel)?;
                Ok(Response::Leaderboard {
                    service_version: SERVICE_VERSION.to_string(),
                    entries: entries.into_iter().map(WireLeaderboardEntry::from).collect(),
                })
            }

            Request::Check => Ok(Response::Status {
                status: "ok".to_string(),
            }),

            Request::Shutdown => {
                tracing::info!("Shutdown requested");
                self.shutdown.store(true, Ordering::SeqCst);
                Ok(Response::Ok { ok: true })
            }
        }
    }

    /// Decode, handle and encode one frame payload
    pub fn handle_frame(&self, payload: &[u8]) -> Vec<u8> {
        let response = match rmp_serde::from_slice::<Request>(payload) {
            Ok(request) => self.handle(request),
            Err(e) => Response::error(format!("Invalid request: {}", e), ErrorKind::InvalidInput),
        };
        encode_response(&response)
    }
}

/// Named-field MessagePack, falling back to an encoded error response
pub fn encode_response(response: &Response) -> Vec<u8> {
    match rmp_serde::to_vec_named(response) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Serialize error: {}", e);
            let fallback = Response::error(format!("Serialize error: {}", e), ErrorKind::Backend);
            rmp_serde::to_vec_named(&fallback).unwrap_or_default()
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Read one frame; `Ok(None)` on a clean end of stream
pub fn read_message<R: Read>(stream: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_message<W: Write>(stream: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}
