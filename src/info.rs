//! Read-only payloads handed to the embedder through events and the
//! non-blocking getters.

use std::sync::Arc;

use bitflags::bitflags;

use crate::config::{ExcludeManager, IncludeManager};
use crate::entry::{Entry, EntryKind};
use crate::sort::{SortDirection, SortKey};

/// Summary of the store contents and its configuration.
#[derive(Debug, Clone)]
pub struct DatabaseInfo {
    includes: IncludeManager,
    excludes: ExcludeManager,
    num_files: u32,
    num_folders: u32,
}

impl DatabaseInfo {
    #[must_use]
    pub(crate) fn new(
        includes: IncludeManager,
        excludes: ExcludeManager,
        num_files: u32,
        num_folders: u32,
    ) -> Self {
        Self {
            includes,
            excludes,
            num_files,
            num_folders,
        }
    }

    #[must_use]
    pub fn includes(&self) -> &IncludeManager {
        &self.includes
    }

    #[must_use]
    pub fn excludes(&self) -> &ExcludeManager {
        &self.excludes
    }

    #[must_use]
    pub fn num_files(&self) -> u32 {
        self.num_files
    }

    #[must_use]
    pub fn num_folders(&self) -> u32 {
        self.num_folders
    }

    #[must_use]
    pub fn num_entries(&self) -> u32 {
        self.num_files + self.num_folders
    }
}

/// Summary of one search view's result set and selection.
#[derive(Debug, Clone, Copy)]
pub struct SearchInfo {
    num_files: u32,
    num_folders: u32,
    num_selected_files: u32,
    num_selected_folders: u32,
    sort_order: SortKey,
    direction: SortDirection,
}

impl SearchInfo {
    #[must_use]
    pub(crate) fn new(
        num_files: u32,
        num_folders: u32,
        num_selected_files: u32,
        num_selected_folders: u32,
        sort_order: SortKey,
        direction: SortDirection,
    ) -> Self {
        Self {
            num_files,
            num_folders,
            num_selected_files,
            num_selected_folders,
            sort_order,
            direction,
        }
    }

    #[must_use]
    pub fn num_files(&self) -> u32 {
        self.num_files
    }

    #[must_use]
    pub fn num_folders(&self) -> u32 {
        self.num_folders
    }

    #[must_use]
    pub fn num_entries(&self) -> u32 {
        self.num_files + self.num_folders
    }

    #[must_use]
    pub fn num_selected_files(&self) -> u32 {
        self.num_selected_files
    }

    #[must_use]
    pub fn num_selected_folders(&self) -> u32 {
        self.num_selected_folders
    }

    #[must_use]
    pub fn sort_order(&self) -> SortKey {
        self.sort_order
    }

    #[must_use]
    pub fn direction(&self) -> SortDirection {
        self.direction
    }
}

bitflags! {
    /// Which fields to synthesise into an [`EntryInfo`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryInfoFlags: u32 {
        const NAME = 1 << 0;
        const PATH = 1 << 1;
        const FULL_PATH = 1 << 2;
        const EXTENSION = 1 << 3;
        const SIZE = 1 << 4;
        const MODIFICATION_TIME = 1 << 5;
        const SELECTED = 1 << 6;
        const INDEX = 1 << 7;
    }
}

impl EntryInfoFlags {
    pub const ALL: Self = Self::all();
}

/// Snapshot of one entry, with only the requested fields populated.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    kind: EntryKind,
    name: Option<String>,
    path: Option<String>,
    full_path: Option<String>,
    extension: Option<String>,
    size: Option<u64>,
    mtime: Option<i64>,
    selected: Option<bool>,
    index: Option<u32>,
}

impl EntryInfo {
    #[must_use]
    pub(crate) fn from_entry(
        entry: &Arc<Entry>,
        idx: u32,
        selected: bool,
        flags: EntryInfoFlags,
    ) -> Self {
        Self {
            kind: entry.kind(),
            name: flags
                .contains(EntryInfoFlags::NAME)
                .then(|| entry.name().to_string()),
            path: flags.contains(EntryInfoFlags::PATH).then(|| entry.path()),
            full_path: flags
                .contains(EntryInfoFlags::FULL_PATH)
                .then(|| entry.full_path()),
            extension: flags
                .contains(EntryInfoFlags::EXTENSION)
                .then(|| entry.extension().to_string()),
            size: flags.contains(EntryInfoFlags::SIZE).then(|| entry.size()),
            mtime: flags
                .contains(EntryInfoFlags::MODIFICATION_TIME)
                .then(|| entry.mtime()),
            selected: flags
                .contains(EntryInfoFlags::SELECTED)
                .then_some(selected),
            index: flags.contains(EntryInfoFlags::INDEX).then_some(idx),
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn full_path(&self) -> Option<&str> {
        self.full_path.as_deref()
    }

    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    #[must_use]
    pub fn mtime(&self) -> Option<i64> {
        self.mtime
    }

    #[must_use]
    pub fn selected(&self) -> Option<bool> {
        self.selected
    }

    #[must_use]
    pub fn index(&self) -> Option<u32> {
        self.index
    }
}
