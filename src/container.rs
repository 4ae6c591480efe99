//! Ordered, indexable multiset of entries under a `(primary, secondary)` key.
//!
//! Internally the container keeps its entries in shards of bounded size so
//! that inserts and steals move at most one shard's worth of memory. Shards
//! are split when they grow past twice the ideal size and dropped when they
//! empty out (the last shard always remains). Externally the container
//! presents a single ordered sequence; `joined` materialises it.
//!
//! Reads are safe concurrently; writers rely on external exclusion (the
//! store mutex or the owning index's lock).

use std::cmp::Ordering;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::cancel::CancelToken;
use crate::entry::{Entry, EntryKind};
use crate::error::{Error, Result};
use crate::sort::{SortKey, compare_keyed, compare_total};

const IDEAL_ENTRIES_PER_SHARD: usize = 8192;

pub struct EntriesContainer {
    primary: SortKey,
    secondary: Option<SortKey>,
    kind: EntryKind,
    shard_capacity: usize,
    inner: RwLock<Shards>,
}

struct Shards {
    shards: Vec<Vec<Arc<Entry>>>,
    num_entries: usize,
}

impl EntriesContainer {
    /// Build a container over `entries`, sorting them unless `presorted`.
    /// Fails with [`Error::Cancelled`] when the token trips mid-build.
    ///
    /// The input vector is owned; nothing else can alias it afterwards.
    pub fn from_entries(
        mut entries: Vec<Arc<Entry>>,
        presorted: bool,
        primary: SortKey,
        secondary: Option<SortKey>,
        kind: EntryKind,
        cancel: &CancelToken,
    ) -> Result<Self> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !presorted {
            entries.sort_unstable_by(|a, b| compare_total(a, b, primary, secondary));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Self::with_shard_capacity(
            IDEAL_ENTRIES_PER_SHARD,
            entries,
            primary,
            secondary,
            kind,
        ))
    }

    fn with_shard_capacity(
        shard_capacity: usize,
        entries: Vec<Arc<Entry>>,
        primary: SortKey,
        secondary: Option<SortKey>,
        kind: EntryKind,
    ) -> Self {
        debug_assert!(entries.iter().all(|e| e.kind() == kind));
        let num_entries = entries.len();
        Self {
            primary,
            secondary,
            kind,
            shard_capacity,
            inner: RwLock::new(Shards {
                shards: split_entries(entries, shard_capacity),
                num_entries,
            }),
        }
    }

    /// Test-only constructor with a tiny shard size to force splitting.
    #[cfg(test)]
    pub(crate) fn for_tests(
        entries: Vec<Arc<Entry>>,
        shard_capacity: usize,
        primary: SortKey,
        secondary: Option<SortKey>,
        kind: EntryKind,
    ) -> Self {
        let mut entries = entries;
        entries.sort_unstable_by(|a, b| compare_total(a, b, primary, secondary));
        Self::with_shard_capacity(shard_capacity, entries, primary, secondary, kind)
    }

    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        self.primary
    }

    #[must_use]
    pub fn secondary_sort_key(&self) -> Option<SortKey> {
        self.secondary
    }

    #[must_use]
    pub fn entry_kind(&self) -> EntryKind {
        self.kind
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.inner.read().expect("container lock poisoned").num_entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_entries() == 0
    }

    /// Place `entry` at its sorted position.
    pub fn insert(&self, entry: Arc<Entry>) {
        debug_assert_eq!(entry.kind(), self.kind);
        let mut inner = self.inner.write().expect("container lock poisoned");
        let shard_idx = self.shard_index_for(&inner.shards, &entry);
        let shard = &mut inner.shards[shard_idx];
        let pos = shard
            .partition_point(|e| compare_total(e, &entry, self.primary, self.secondary) == Ordering::Less);
        shard.insert(pos, entry);
        inner.num_entries += 1;
        self.balance(&mut inner, shard_idx);
    }

    /// Remove `entry` (by identity) if present; returns whether it was removed.
    pub fn steal(&self, entry: &Arc<Entry>) -> bool {
        let mut inner = self.inner.write().expect("container lock poisoned");
        if inner.num_entries == 0 {
            return false;
        }

        let shard_idx = self.shard_index_for(&inner.shards, entry);
        if let Some(pos) = self.position_of(&inner.shards[shard_idx], entry) {
            inner.shards[shard_idx].remove(pos);
            inner.num_entries -= 1;
            self.balance(&mut inner, shard_idx);
            return true;
        }

        // The keyed search can miss when the entry's attributes changed after
        // it was placed (a size-sorted container looking at a grown file) or
        // when an equal-key run spans shards. Fall back to an identity scan.
        for shard_idx in 0..inner.shards.len() {
            if let Some(pos) = inner.shards[shard_idx]
                .iter()
                .position(|e| Arc::ptr_eq(e, entry))
            {
                debug!("steal fell back to identity scan for {:?}", entry.name());
                inner.shards[shard_idx].remove(pos);
                inner.num_entries -= 1;
                self.balance(&mut inner, shard_idx);
                return true;
            }
        }
        false
    }

    /// Find an entry comparing equal to `probe` under the container's keys.
    ///
    /// Under a `(Name, Path)` ordering an equal comparison means "same name
    /// under the same parent", which is how monitor events are resolved to
    /// entries.
    #[must_use]
    pub fn find(&self, probe: &Arc<Entry>) -> Option<Arc<Entry>> {
        let inner = self.inner.read().expect("container lock poisoned");
        if inner.num_entries == 0 {
            return None;
        }
        let shard_idx = self.shard_index_for(&inner.shards, probe);
        let shard = &inner.shards[shard_idx];
        let pos = shard
            .partition_point(|e| self.compare_key(e, probe) == Ordering::Less);
        shard
            .get(pos)
            .filter(|e| self.compare_key(e, probe) == Ordering::Equal)
            .cloned()
    }

    /// The i-th entry in sort order.
    #[must_use]
    pub fn get(&self, mut idx: usize) -> Option<Arc<Entry>> {
        let inner = self.inner.read().expect("container lock poisoned");
        for shard in &inner.shards {
            if idx < shard.len() {
                return Some(Arc::clone(&shard[idx]));
            }
            idx -= shard.len();
        }
        None
    }

    /// Materialise the full ordered sequence.
    #[must_use]
    pub fn joined(&self) -> Vec<Arc<Entry>> {
        let inner = self.inner.read().expect("container lock poisoned");
        let mut joined = Vec::with_capacity(inner.num_entries);
        for shard in &inner.shards {
            joined.extend(shard.iter().cloned());
        }
        joined
    }

    /// Remove and return every descendant of `folder`, stopping early when
    /// `expected` descendants have been collected.
    pub fn steal_descendants(
        &self,
        folder: &Arc<Entry>,
        expected: Option<usize>,
    ) -> Vec<Arc<Entry>> {
        let mut inner = self.inner.write().expect("container lock poisoned");
        let mut stolen = Vec::with_capacity(expected.unwrap_or(16));

        let mut shard_idx = 0;
        while shard_idx < inner.shards.len() {
            if expected.is_some_and(|n| stolen.len() == n) {
                break;
            }
            let mut pos = 0;
            while pos < inner.shards[shard_idx].len() {
                if inner.shards[shard_idx][pos].is_descendant_of(folder) {
                    stolen.push(inner.shards[shard_idx].remove(pos));
                } else {
                    pos += 1;
                }
            }
            if inner.shards[shard_idx].is_empty() && inner.shards.len() > 1 {
                inner.shards.remove(shard_idx);
            } else {
                shard_idx += 1;
            }
        }

        inner.num_entries -= stolen.len();
        if let Some(expected) = expected {
            debug_assert_eq!(stolen.len(), expected);
        }
        stolen
    }

    fn compare_key(&self, a: &Entry, b: &Entry) -> Ordering {
        compare_keyed(a, b, self.primary, self.secondary)
    }

    /// Locate the shard whose `[first, last]` key range covers `entry`.
    fn shard_index_for(&self, shards: &[Vec<Arc<Entry>>], entry: &Arc<Entry>) -> usize {
        if shards.len() == 1 {
            return 0;
        }
        let idx = shards.partition_point(|shard| {
            shard
                .last()
                .is_some_and(|e| self.compare_key(e, entry) == Ordering::Less)
        });
        idx.min(shards.len() - 1)
    }

    /// Exact position of `entry` (by identity) within one shard: binary
    /// search to the start of the key-equal run, then walk the run.
    fn position_of(&self, shard: &[Arc<Entry>], entry: &Arc<Entry>) -> Option<usize> {
        let start = shard.partition_point(|e| self.compare_key(e, entry) == Ordering::Less);
        for (pos, candidate) in shard.iter().enumerate().skip(start) {
            if self.compare_key(candidate, entry) != Ordering::Equal {
                break;
            }
            if Arc::ptr_eq(candidate, entry) {
                return Some(pos);
            }
        }
        None
    }

    fn balance(&self, inner: &mut Shards, shard_idx: usize) {
        let len = inner.shards[shard_idx].len();
        if len == 0 {
            if inner.shards.len() > 1 {
                inner.shards.remove(shard_idx);
            }
            return;
        }
        if len < 2 * self.shard_capacity {
            return;
        }
        debug!("splitting shard {shard_idx} with {len} entries");
        let shard = inner.shards.remove(shard_idx);
        for (offset, split) in split_entries(shard, self.shard_capacity).into_iter().enumerate() {
            inner.shards.insert(shard_idx + offset, split);
        }
    }
}

/// Split a sorted vector into roughly even shards of at most `capacity`
/// entries. Always yields at least one (possibly empty) shard.
fn split_entries(entries: Vec<Arc<Entry>>, capacity: usize) -> Vec<Vec<Arc<Entry>>> {
    let len = entries.len();
    if len <= capacity {
        return vec![entries];
    }
    let num_splits = len.div_ceil(capacity);
    let per_split = len / num_splits;

    let mut shards = Vec::with_capacity(num_splits);
    let mut rest = entries;
    while shards.len() + 1 < num_splits {
        let tail = rest.split_off(per_split);
        shards.push(rest);
        rest = tail;
    }
    shards.push(rest);
    shards
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_set(names: &[&str]) -> (Arc<Entry>, Vec<Arc<Entry>>) {
        let root = Entry::new_root("/", 0, 0, 0);
        let files = names
            .iter()
            .map(|name| Entry::new_file(name, 0, 0, Arc::clone(&root)))
            .collect();
        (root, files)
    }

    fn names_of(container: &EntriesContainer) -> Vec<String> {
        container
            .joined()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    #[test]
    fn builds_in_sorted_order_across_shards() {
        let (_root, files) = file_set(&["f", "b", "d", "a", "e", "c", "h", "g"]);
        let container =
            EntriesContainer::for_tests(files, 2, SortKey::Name, None, EntryKind::File);
        assert_eq!(container.num_entries(), 8);
        assert_eq!(names_of(&container), ["a", "b", "c", "d", "e", "f", "g", "h"]);
        for i in 0..8 {
            let a = container.get(i).unwrap();
            if let Some(b) = container.get(i + 1) {
                assert!(compare_keyed(&a, &b, SortKey::Name, None) != Ordering::Greater);
            }
        }
        assert!(container.get(8).is_none());
    }

    #[test]
    fn insert_keeps_order_and_splits_shards() {
        let (root, files) = file_set(&["b", "d"]);
        let container =
            EntriesContainer::for_tests(files, 2, SortKey::Name, None, EntryKind::File);
        for name in ["a", "c", "e", "aa", "bb", "cc"] {
            container.insert(Entry::new_file(name, 0, 0, Arc::clone(&root)));
        }
        assert_eq!(
            names_of(&container),
            ["a", "aa", "b", "bb", "c", "cc", "d", "e"]
        );
    }

    #[test]
    fn steal_removes_by_identity() {
        let (root, files) = file_set(&["a", "b", "c"]);
        let twin = Entry::new_file("b", 0, 0, Arc::clone(&root));
        let container = EntriesContainer::for_tests(
            files.clone(),
            8,
            SortKey::Name,
            None,
            EntryKind::File,
        );
        container.insert(Arc::clone(&twin));
        assert_eq!(container.num_entries(), 4);

        // Stealing the twin must not remove the equally-named original.
        assert!(container.steal(&twin));
        assert!(!container.steal(&twin));
        assert_eq!(names_of(&container), ["a", "b", "c"]);
        assert!(container.joined().iter().any(|e| Arc::ptr_eq(e, &files[1])));
    }

    #[test]
    fn steal_survives_mutated_keys() {
        let (_root, files) = file_set(&["a", "b", "c"]);
        let container = EntriesContainer::for_tests(
            files.clone(),
            8,
            SortKey::Size,
            None,
            EntryKind::File,
        );
        files[1].set_size(4096);
        assert!(container.steal(&files[1]));
        assert_eq!(container.num_entries(), 2);
    }

    #[test]
    fn find_resolves_probe_entries() {
        let root = Entry::new_root("/", 0, 0, 0);
        let sub = Entry::new_folder("sub", 0, 0, 0, Arc::clone(&root));
        let in_root = Entry::new_file("x", 0, 0, Arc::clone(&root));
        let in_sub = Entry::new_file("x", 0, 0, Arc::clone(&sub));
        let container = EntriesContainer::for_tests(
            vec![Arc::clone(&in_root), Arc::clone(&in_sub)],
            8,
            SortKey::Name,
            Some(SortKey::Path),
            EntryKind::File,
        );

        let probe = Entry::probe(EntryKind::File, "x", Arc::clone(&sub));
        let found = container.find(&probe).unwrap();
        assert!(Arc::ptr_eq(&found, &in_sub));
        let missing = Entry::probe(EntryKind::File, "y", Arc::clone(&sub));
        assert!(container.find(&missing).is_none());
    }

    #[test]
    fn steal_descendants_empties_a_subtree() {
        let root = Entry::new_root("/", 0, 0, 0);
        let keep = Entry::new_file("keep", 0, 0, Arc::clone(&root));
        let sub = Entry::new_folder("sub", 0, 0, 0, Arc::clone(&root));
        let nested = Entry::new_folder("nested", 0, 0, 0, Arc::clone(&sub));
        let a = Entry::new_file("a", 0, 0, Arc::clone(&sub));
        let b = Entry::new_file("b", 0, 0, Arc::clone(&nested));
        let container = EntriesContainer::for_tests(
            vec![Arc::clone(&keep), Arc::clone(&a), Arc::clone(&b)],
            2,
            SortKey::Name,
            Some(SortKey::Path),
            EntryKind::File,
        );

        let stolen = container.steal_descendants(&sub, Some(2));
        assert_eq!(stolen.len(), 2);
        assert_eq!(container.num_entries(), 1);
        assert_eq!(names_of(&container), ["keep"]);
    }

    #[test]
    fn cancelled_build_fails() {
        let (_root, files) = file_set(&["a"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            EntriesContainer::from_entries(
                files,
                false,
                SortKey::Name,
                None,
                EntryKind::File,
                &cancel
            ),
            Err(Error::Cancelled)
        ));
    }
}
