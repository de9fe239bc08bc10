//! Graph traversal over bitmap adjacency

use roaring::RoaringBitmap;

use crate::error::Result;

/// Level-synchronous BFS from `start`, returning every reachable id
/// including the start ids themselves.
///
/// `expand` receives a whole frontier at once and returns the union of its
/// neighbors, so a storage-backed caller can load each level in one batch.
pub fn reachable<F>(start: &RoaringBitmap, mut expand: F) -> Result<RoaringBitmap>
where
    F: FnMut(&RoaringBitmap) -> Result<RoaringBitmap>,
{
    let mut visited = start.clone();
    let mut frontier = start.clone();

    while !frontier.is_empty() {
        let mut next = expand(&frontier)?;
        next -= &visited;
        visited |= &next;
        frontier = next;
    }

    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn expand_with(edges: &HashMap<u32, Vec<u32>>) -> impl FnMut(&RoaringBitmap) -> Result<RoaringBitmap> + '_ {
        move |frontier| {
            Ok(frontier
                .iter()
                .flat_map(|id| edges.get(&id).cloned().unwrap_or_default())
                .collect())
        }
    }

    #[test]
    fn test_reachable_simple_graph() {
        // 1 -> 2 -> 3
        // 1 -> 4
        let edges: HashMap<u32, Vec<u32>> = [
            (1, vec![2, 4]),
            (2, vec![3]),
            (3, vec![]),
            (4, vec![]),
        ]
        .into_iter()
        .collect();

        let start: RoaringBitmap = [1u32].into_iter().collect();
        let result = reachable(&start, expand_with(&edges)).unwrap();
        assert_eq!(result.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let start: RoaringBitmap = [2u32].into_iter().collect();
        let result = reachable(&start, expand_with(&edges)).unwrap();
        assert_eq!(result.iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_reachable_with_cycle_terminates() {
        // 1 -> 2 -> 3 -> 1, 3 -> 5
        let edges: HashMap<u32, Vec<u32>> = [
            (1, vec![2]),
            (2, vec![3]),
            (3, vec![1, 5]),
        ]
        .into_iter()
        .collect();

        let start: RoaringBitmap = [2u32].into_iter().collect();
        let result = reachable(&start, expand_with(&edges)).unwrap();
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_reachable_empty_start() {
        let edges = HashMap::new();
        let result = reachable(&RoaringBitmap::new(), expand_with(&edges)).unwrap();
        assert!(result.is_empty());
    }
}
