//! Sort keys, comparator dispatch and the re-sort paths used by views.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::mpsc::channel;

use crate::cancel::CancelToken;
use crate::container::EntriesContainer;
use crate::entry::{
    Entry, compare_by_extension, compare_by_mtime, compare_by_name, compare_by_path,
    compare_by_size, entry_key,
};
use crate::error::{Error, Result};
use crate::thread_pool::ThreadPool;

/// Number of supported sort keys; also the exclusive upper bound for sorted
/// array ids in the snapshot format.
pub const NUM_SORT_KEYS: usize = 5;

/// Entry property a container can be ordered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortKey {
    Name,
    Path,
    Size,
    ModificationTime,
    Extension,
}

impl SortKey {
    /// All keys, in wire-id order. `Name` is id 0 and implicit in the
    /// snapshot's primary blocks.
    pub const ALL: [SortKey; NUM_SORT_KEYS] = [
        SortKey::Name,
        SortKey::Path,
        SortKey::Size,
        SortKey::ModificationTime,
        SortKey::Extension,
    ];

    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            SortKey::Name => 0,
            SortKey::Path => 1,
            SortKey::Size => 2,
            SortKey::ModificationTime => 3,
            SortKey::Extension => 4,
        }
    }

    #[must_use]
    pub fn from_u32(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Compare two entries under a single key.
#[must_use]
pub fn compare(a: &Entry, b: &Entry, key: SortKey) -> Ordering {
    match key {
        SortKey::Name => compare_by_name(a, b),
        SortKey::Path => compare_by_path(a, b),
        SortKey::Size => compare_by_size(a, b),
        SortKey::ModificationTime => compare_by_mtime(a, b),
        SortKey::Extension => compare_by_extension(a, b),
    }
}

/// Compare under `(primary, secondary)`, leaving exact ties to the caller.
#[must_use]
pub fn compare_keyed(
    a: &Entry,
    b: &Entry,
    primary: SortKey,
    secondary: Option<SortKey>,
) -> Ordering {
    let ord = compare(a, b, primary);
    match (ord, secondary) {
        (Ordering::Equal, Some(key)) => compare(a, b, key),
        _ => ord,
    }
}

/// Full deterministic ordering: `(primary, secondary)` with an identity
/// tiebreak so that any two distinct entries have a total order.
#[must_use]
pub(crate) fn compare_total(
    a: &Arc<Entry>,
    b: &Arc<Entry>,
    primary: SortKey,
    secondary: Option<SortKey>,
) -> Ordering {
    compare_keyed(a, b, primary, secondary).then_with(|| entry_key(a).cmp(&entry_key(b)))
}

/// Extension order never re-sorts folders: they are kept in a separate
/// container and all share the empty extension.
#[must_use]
pub(crate) fn affects_folders(key: SortKey) -> bool {
    key != SortKey::Extension
}

const PARALLEL_SORT_THRESHOLD: usize = 4096;

/// Sort entries under `(key, identity)` using the shared pool for the chunk
/// phase and a sequential merge. Fails with [`Error::Cancelled`] between
/// phases when the token trips.
pub(crate) fn sort_entries(
    mut entries: Vec<Arc<Entry>>,
    key: SortKey,
    pool: &ThreadPool,
    cancel: &CancelToken,
) -> Result<Vec<Arc<Entry>>> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    if entries.len() < PARALLEL_SORT_THRESHOLD || pool.num_threads() < 2 {
        entries.sort_unstable_by(|a, b| compare_total(a, b, key, None));
        return Ok(entries);
    }

    let num_chunks = pool.num_threads().min(entries.len() / (PARALLEL_SORT_THRESHOLD / 4));
    let chunk_len = entries.len().div_ceil(num_chunks.max(2));

    let (chunk_tx, chunk_rx) = channel();
    let mut num_sent = 0;
    while !entries.is_empty() {
        let rest = entries.split_off(entries.len().saturating_sub(chunk_len));
        let chunk_tx = chunk_tx.clone();
        let position = num_sent;
        pool.execute(move || {
            let mut chunk = rest;
            chunk.sort_unstable_by(|a, b| compare_total(a, b, key, None));
            let _ = chunk_tx.send((position, chunk));
        });
        num_sent += 1;
    }
    drop(chunk_tx);

    let mut sorted_chunks: Vec<Option<Vec<Arc<Entry>>>> = vec![None; num_sent];
    for (position, chunk) in chunk_rx {
        sorted_chunks[position] = Some(chunk);
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut merged: Vec<Arc<Entry>> = Vec::new();
    for chunk in sorted_chunks.into_iter().flatten() {
        merged = merge_sorted(merged, chunk, key);
    }
    Ok(merged)
}

fn merge_sorted(a: Vec<Arc<Entry>>, b: Vec<Arc<Entry>>, key: SortKey) -> Vec<Arc<Entry>> {
    if a.is_empty() {
        return b;
    }
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if compare_total(x, y, key, None) != Ordering::Greater {
                    merged.push(a.next().expect("peeked element exists"));
                } else {
                    merged.push(b.next().expect("peeked element exists"));
                }
            }
            (Some(_), None) => merged.extend(a.by_ref()),
            (None, Some(_)) => merged.extend(b.by_ref()),
            (None, None) => break,
        }
    }
    merged
}

/// Re-order a view's entries for `new_key`.
///
/// When the store maintains a container for the key, its order is reused as a
/// merge hint: the view entries are marked and collected by walking the
/// reference order, which costs one pass instead of a comparison sort. Root
/// entries in the reference are never marked and fall through naturally.
pub(crate) fn resort_entries(
    entries: Vec<Arc<Entry>>,
    reference: Option<&EntriesContainer>,
    new_key: SortKey,
    pool: &ThreadPool,
    cancel: &CancelToken,
) -> Result<Vec<Arc<Entry>>> {
    let Some(reference) = reference else {
        return sort_entries(entries, new_key, pool, cancel);
    };

    for entry in &entries {
        entry.set_mark(true);
    }
    let mut reordered = Vec::with_capacity(entries.len());
    for entry in reference.joined() {
        if reordered.len() == entries.len() {
            break;
        }
        if entry.mark() {
            entry.set_mark(false);
            reordered.push(entry);
        }
    }
    // Clear stragglers so a partial walk never leaks marks.
    for entry in &entries {
        entry.set_mark(false);
    }
    Ok(reordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    fn files(names: &[&str]) -> Vec<Arc<Entry>> {
        let root = Entry::new_root("/", 0, 0, 0);
        names
            .iter()
            .map(|name| Entry::new_file(name, 0, 0, Arc::clone(&root)))
            .collect()
    }

    #[test]
    fn wire_ids_round_trip() {
        for key in SortKey::ALL {
            assert_eq!(SortKey::from_u32(key.as_u32()), Some(key));
        }
        assert_eq!(SortKey::from_u32(NUM_SORT_KEYS as u32), None);
    }

    #[test]
    fn sort_entries_orders_by_key() {
        let pool = ThreadPool::new(2);
        let cancel = CancelToken::new();
        let sorted = sort_entries(files(&["c", "a", "b"]), SortKey::Name, &pool, &cancel).unwrap();
        let names: Vec<_> = sorted.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn cancelled_sort_fails() {
        let pool = ThreadPool::new(2);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            sort_entries(files(&["a"]), SortKey::Name, &pool, &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn resort_reuses_reference_order() {
        let pool = ThreadPool::new(1);
        let cancel = CancelToken::new();
        let all = files(&["b", "a", "c"]);
        let reference = EntriesContainer::from_entries(
            all.clone(),
            false,
            SortKey::Name,
            None,
            EntryKind::File,
            &cancel,
        )
        .unwrap();

        // A subset in arbitrary order comes back in reference (name) order.
        let subset = vec![Arc::clone(&all[2]), Arc::clone(&all[0])];
        let reordered =
            resort_entries(subset, Some(&reference), SortKey::Name, &pool, &cancel).unwrap();
        let names: Vec<_> = reordered.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, ["b", "c"]);
    }
}
