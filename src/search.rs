//! Query evaluation over a container's entries, parallelised across the
//! shared thread pool.

use std::sync::Arc;
use std::sync::mpsc::channel;

use crate::cancel::CancelToken;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::thread_pool::ThreadPool;

const PARALLEL_SEARCH_THRESHOLD: usize = 1000;

/// Collect the entries matching `query`, preserving input order. Root anchor
/// entries never appear in results.
pub(crate) fn evaluate_query(
    query: &Arc<dyn Query>,
    entries: Vec<Arc<Entry>>,
    pool: &ThreadPool,
    cancel: &CancelToken,
) -> Result<Vec<Arc<Entry>>> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    if query.matches_everything() {
        return Ok(entries.into_iter().filter(|e| !e.is_root()).collect());
    }

    if entries.len() < PARALLEL_SEARCH_THRESHOLD || pool.num_threads() < 2 {
        return Ok(entries
            .into_iter()
            .filter(|e| !e.is_root() && query.is_match(e))
            .collect());
    }

    let entries = Arc::new(entries);
    let num_shards = pool.num_threads();
    let shard_len = entries.len().div_ceil(num_shards);
    let (result_tx, result_rx) = channel();

    for shard in 0..num_shards {
        let entries = Arc::clone(&entries);
        let query = Arc::clone(query);
        let cancel = cancel.clone();
        let result_tx = result_tx.clone();
        pool.execute(move || {
            let start = shard * shard_len;
            let end = ((shard + 1) * shard_len).min(entries.len());
            let mut matched = Vec::new();
            for entry in entries[start..end].iter() {
                if cancel.is_cancelled() {
                    break;
                }
                if !entry.is_root() && query.is_match(entry) {
                    matched.push(Arc::clone(entry));
                }
            }
            let _ = result_tx.send((shard, matched));
        });
    }
    drop(result_tx);

    let mut shards: Vec<Vec<Arc<Entry>>> = (0..num_shards).map(|_| Vec::new()).collect();
    for (shard, matched) in result_rx {
        shards[shard] = matched;
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(shards.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{MatchEverything, NameContains};

    fn entries(count: usize) -> Vec<Arc<Entry>> {
        let root = Entry::new_root("/", 0, 0, 0);
        let mut all = vec![Arc::clone(&root)];
        all.extend(
            (0..count).map(|i| Entry::new_file(&format!("file-{i:05}"), 0, 0, Arc::clone(&root))),
        );
        all
    }

    #[test]
    fn match_everything_skips_only_roots() {
        let pool = ThreadPool::new(2);
        let query: Arc<dyn Query> = Arc::new(MatchEverything);
        let result = evaluate_query(&query, entries(10), &pool, &CancelToken::new()).unwrap();
        assert_eq!(result.len(), 10);
        assert!(result.iter().all(|e| !e.is_root()));
    }

    #[test]
    fn parallel_path_preserves_order() {
        let pool = ThreadPool::new(4);
        let query: Arc<dyn Query> = Arc::new(NameContains::new("file"));
        let result = evaluate_query(
            &query,
            entries(PARALLEL_SEARCH_THRESHOLD * 2),
            &pool,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(result.len(), PARALLEL_SEARCH_THRESHOLD * 2);
        for window in result.windows(2) {
            assert!(window[0].name() < window[1].name());
        }
    }

    #[test]
    fn cancellation_aborts_the_search() {
        let pool = ThreadPool::new(2);
        let query: Arc<dyn Query> = Arc::new(NameContains::new("file"));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            evaluate_query(&query, entries(4), &pool, &cancel),
            Err(Error::Cancelled)
        ));
    }
}
