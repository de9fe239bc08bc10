//! Leaderboards: one script evaluated once per node, ranked by result size

use rayon::prelude::*;
use roaring::RoaringBitmap;

use crate::cancel::CancelToken;
use crate::error::{MinefieldError, Result};
use crate::graph::Node;
use crate::query::eval::{execute, Snapshot};
use crate::query::parser::parse_script;
use crate::storage::Storage;

/// One ranked node and the ids its evaluation produced
#[derive(Debug, Clone)]
pub struct LeaderboardEntry {
    pub node: Node,
    pub output: RoaringBitmap,
}

/// Evaluate `script` with every named node as the default, largest result first.
///
/// Requires a coherent cache. Work is spread over a dedicated pool of
/// `concurrency` threads; the first failing evaluation aborts the whole run.
/// Ties are broken by ascending node id. `limit` of `None` keeps every entry.
pub fn run(
    storage: &dyn Storage,
    script: &str,
    limit: Option<usize>,
    concurrency: usize,
    cancel: &CancelToken,
) -> Result<Vec<LeaderboardEntry>> {
    if !storage.to_be_cached()?.is_empty() {
        return Err(MinefieldError::Precondition(
            "cannot use sorted leaderboards without caching".to_string(),
        ));
    }

    let expr = parse_script(script)?;
    let snapshot = Snapshot::load(storage)?;

    let candidates: Vec<&Node> = snapshot.nodes().filter(|n| !n.name.is_empty()).collect();
    tracing::debug!(
        "Leaderboard over {} of {} nodes on {} threads",
        candidates.len(),
        snapshot.len(),
        concurrency.max(1)
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .thread_name(|i| format!("leaderboard-{}", i))
        .build()?;

    let snapshot_ref = &snapshot;
    let expr_ref = &expr;
    let mut rows: Vec<(&Node, RoaringBitmap)> = pool.install(|| {
        candidates
            .par_iter()
            .map(|&node| {
                cancel.check()?;
                let output = execute(expr_ref, snapshot_ref, Some(&node.name))?;
                Ok((node, output))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    rows.sort_by(|(a, a_out), (b, b_out)| b_out.len().cmp(&a_out.len()).then(a.id.cmp(&b.id)));
    if let Some(limit) = limit {
        rows.truncate(limit);
    }

    Ok(rows
        .into_iter()
        .map(|(node, output)| LeaderboardEntry {
            node: node.clone(),
            output,
        })
        .collect())
}
