//! In-memory record for one file or folder.
//!
//! Entries are shared between the store's sorted containers, the per-root
//! index that created them and any number of search views; `Arc` pointer
//! identity is the entry's identity. The parent link is set exactly once
//! (at scan time, or in the snapshot loader's wiring pass) and forms an
//! up-pointing tree with the configured root folder at the top.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug)]
pub struct Entry {
    kind: EntryKind,
    name: Box<str>,
    parent: OnceLock<Option<Arc<Entry>>>,
    size: AtomicU64,
    mtime: AtomicI64,
    // Position in the name-sorted container, refreshed right before a
    // snapshot is written. Meaningless at any other time.
    idx: AtomicU32,
    // Scratch flag for the fast re-sort pass.
    mark: AtomicBool,
    // Id of the owning root index. Files resolve it through their parent.
    db_index: u32,
}

impl Entry {
    fn new(kind: EntryKind, name: &str, db_index: u32, size: u64, mtime: i64) -> Self {
        Self {
            kind,
            name: name.into(),
            parent: OnceLock::new(),
            size: AtomicU64::new(size),
            mtime: AtomicI64::new(mtime),
            idx: AtomicU32::new(0),
            mark: AtomicBool::new(false),
            db_index,
        }
    }

    /// Create the anchor entry for a configured root. Its name is the full
    /// root path; every other entry name is a separator-free basename.
    #[must_use]
    pub fn new_root(path: &str, db_index: u32, size: u64, mtime: i64) -> Arc<Self> {
        let entry = Self::new(EntryKind::Folder, path, db_index, size, mtime);
        entry
            .parent
            .set(None)
            .expect("fresh entry has no parent yet");
        Arc::new(entry)
    }

    #[must_use]
    pub fn new_folder(
        name: &str,
        db_index: u32,
        size: u64,
        mtime: i64,
        parent: Arc<Entry>,
    ) -> Arc<Self> {
        debug_assert!(parent.is_folder());
        let entry = Self::new(EntryKind::Folder, name, db_index, size, mtime);
        entry
            .parent
            .set(Some(parent))
            .expect("fresh entry has no parent yet");
        Arc::new(entry)
    }

    #[must_use]
    pub fn new_file(name: &str, size: u64, mtime: i64, parent: Arc<Entry>) -> Arc<Self> {
        debug_assert!(parent.is_folder());
        let db_index = parent.db_index;
        let entry = Self::new(EntryKind::File, name, db_index, size, mtime);
        entry
            .parent
            .set(Some(parent))
            .expect("fresh entry has no parent yet");
        Arc::new(entry)
    }

    /// Create an entry whose parent will be wired later via [`Entry::set_parent`].
    /// Used by the snapshot loader, where `parent_idx` may reference a folder
    /// record that has not been decoded yet.
    #[must_use]
    pub(crate) fn new_unparented(
        kind: EntryKind,
        name: &str,
        db_index: u32,
        size: u64,
        mtime: i64,
    ) -> Arc<Self> {
        Arc::new(Self::new(kind, name, db_index, size, mtime))
    }

    /// Wire the parent of an entry created with [`Entry::new_unparented`].
    pub(crate) fn set_parent(&self, parent: Option<Arc<Entry>>) {
        self.parent
            .set(parent)
            .expect("entry parent may only be set once");
    }

    /// Build a throwaway entry that compares equal to the entry with the same
    /// name under the same parent. Used to probe containers for entries only
    /// known by path, e.g. when resolving monitor events.
    #[must_use]
    pub(crate) fn probe(kind: EntryKind, name: &str, parent: Arc<Entry>) -> Arc<Self> {
        let entry = Self::new(kind, name, parent.db_index, 0, 0);
        entry
            .parent
            .set(Some(parent))
            .expect("fresh entry has no parent yet");
        Arc::new(entry)
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parent(&self) -> Option<Arc<Entry>> {
        self.parent.get().and_then(Clone::clone)
    }

    /// Whether this is the anchor entry of a configured root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self.parent.get(), Some(None))
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(AtomicOrdering::Relaxed)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, AtomicOrdering::Relaxed);
    }

    /// Modification time in Unix seconds.
    #[must_use]
    pub fn mtime(&self) -> i64 {
        self.mtime.load(AtomicOrdering::Relaxed)
    }

    pub fn set_mtime(&self, mtime: i64) {
        self.mtime.store(mtime, AtomicOrdering::Relaxed);
    }

    #[must_use]
    pub(crate) fn idx(&self) -> u32 {
        self.idx.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn set_idx(&self, idx: u32) {
        self.idx.store(idx, AtomicOrdering::Relaxed);
    }

    #[must_use]
    pub(crate) fn mark(&self) -> bool {
        self.mark.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn set_mark(&self, mark: bool) {
        self.mark.store(mark, AtomicOrdering::Relaxed);
    }

    /// Id of the root index this entry belongs to.
    #[must_use]
    pub fn db_index(&self) -> u32 {
        match self.kind {
            EntryKind::Folder => self.db_index,
            EntryKind::File => self.parent().map_or(self.db_index, |p| p.db_index),
        }
    }

    /// The suffix after the last dot of the name; empty for folders, dotless
    /// names and names whose only dot is the leading one.
    #[must_use]
    pub fn extension(&self) -> &str {
        if self.is_folder() {
            return "";
        }
        match self.name.rfind('.') {
            Some(pos) if pos > 0 => &self.name[pos + 1..],
            _ => "",
        }
    }

    /// Ancestor chain, root first, not including the entry itself.
    #[must_use]
    pub(crate) fn parent_chain(&self) -> Vec<Arc<Entry>> {
        let mut chain = Vec::new();
        let mut current = self.parent();
        while let Some(folder) = current {
            current = folder.parent();
            chain.push(folder);
        }
        chain.reverse();
        chain
    }

    /// Append the path of the directory containing this entry.
    pub fn append_path(&self, out: &mut String) {
        let chain = self.parent_chain();
        for (pos, folder) in chain.iter().enumerate() {
            if pos > 0 {
                out.push(PATH_SEPARATOR);
            }
            out.push_str(&folder.name);
        }
    }

    /// The path of the directory containing this entry.
    #[must_use]
    pub fn path(&self) -> String {
        let mut out = String::new();
        self.append_path(&mut out);
        out
    }

    /// The full path of this entry. For a root this is its name.
    #[must_use]
    pub fn full_path(&self) -> String {
        let mut out = String::new();
        self.append_path(&mut out);
        if !out.is_empty() {
            out.push(PATH_SEPARATOR);
        }
        out.push_str(&self.name);
        out
    }

    /// Whether `maybe_ancestor` appears anywhere in this entry's parent chain.
    #[must_use]
    pub fn is_descendant_of(&self, maybe_ancestor: &Arc<Entry>) -> bool {
        let mut current = self.parent();
        while let Some(folder) = current {
            if Arc::ptr_eq(&folder, maybe_ancestor) {
                return true;
            }
            current = folder.parent();
        }
        false
    }
}

/// Stable identity key for selection sets and tiebreaks.
#[must_use]
pub(crate) fn entry_key(entry: &Arc<Entry>) -> usize {
    Arc::as_ptr(entry) as usize
}

/// Add `delta` to the recursive size of every ancestor folder.
pub(crate) fn propagate_size(parent: Option<Arc<Entry>>, delta: i64) {
    let mut current = parent;
    while let Some(folder) = current {
        folder
            .size
            .fetch_add(delta as u64, AtomicOrdering::Relaxed);
        current = folder.parent();
    }
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// Compare on the basename, case-insensitive with a case-sensitive tiebreak.
#[must_use]
pub fn compare_by_name(a: &Entry, b: &Entry) -> Ordering {
    cmp_ignore_case(&a.name, &b.name).then_with(|| a.name.cmp(&b.name))
}

/// Compare on the full path without materialising path strings: ancestor
/// names component-wise, then depth, then the entry names themselves.
#[must_use]
pub fn compare_by_path(a: &Entry, b: &Entry) -> Ordering {
    let chain_a = a.parent_chain();
    let chain_b = b.parent_chain();
    for (x, y) in chain_a.iter().zip(chain_b.iter()) {
        if Arc::ptr_eq(x, y) {
            continue;
        }
        let ord = compare_by_name(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    chain_a
        .len()
        .cmp(&chain_b.len())
        .then_with(|| compare_by_name(a, b))
}

#[must_use]
pub fn compare_by_size(a: &Entry, b: &Entry) -> Ordering {
    a.size().cmp(&b.size())
}

#[must_use]
pub fn compare_by_mtime(a: &Entry, b: &Entry) -> Ordering {
    a.mtime().cmp(&b.mtime())
}

#[must_use]
pub fn compare_by_extension(a: &Entry, b: &Entry) -> Ordering {
    a.extension().cmp(b.extension())
}
