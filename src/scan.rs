//! Directory scanner: walks a configured root into entry sets.
//!
//! The walk is serial and yields directories before their contents, which is
//! what lets every entry find its parent folder already constructed. Walk
//! errors (permission, racing deletes) skip the affected entry and keep
//! going, matching how a search index should degrade.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ignore::WalkBuilder;
use log::debug;

use crate::cancel::CancelToken;
use crate::config::{ExcludeManager, Include};
use crate::entry::{Entry, propagate_size};
use crate::error::{Error, Result};

pub(crate) struct ScanOutcome {
    pub root: Arc<Entry>,
    /// All folder entries including the root anchor.
    pub folders: Vec<Arc<Entry>>,
    pub files: Vec<Arc<Entry>>,
}

/// Scan a configured root from scratch.
pub(crate) fn scan_root(
    include: &Include,
    exclude: &ExcludeManager,
    db_index: u32,
    cancel: &CancelToken,
) -> Result<ScanOutcome> {
    let path = include.get_path();
    let meta = std::fs::metadata(path)?;
    let root = Entry::new_root(&path.to_string_lossy(), db_index, 0, mtime_of(&meta));

    let (folders, files) = walk_into(
        path,
        Arc::clone(&root),
        exclude,
        db_index,
        include.get_one_file_system(),
        Some(cancel),
    )?;

    let mut all_folders = Vec::with_capacity(folders.len() + 1);
    all_folders.push(Arc::clone(&root));
    all_folders.extend(folders);

    Ok(ScanOutcome {
        root,
        folders: all_folders,
        files,
    })
}

/// Scan a directory that appeared inside an already-indexed tree. Returns
/// the new folder entries (the subtree root first) and the new files; file
/// sizes are propagated up through `parent` as a side effect.
pub(crate) fn scan_subtree(
    path: &Path,
    parent: Arc<Entry>,
    exclude: &ExcludeManager,
    db_index: u32,
) -> Result<(Vec<Arc<Entry>>, Vec<Arc<Entry>>)> {
    let meta = std::fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::corrupt("subtree path has no basename"))?;
    let anchor = Entry::new_folder(&name, db_index, 0, mtime_of(&meta), parent);

    let (folders, files) = walk_into(path, Arc::clone(&anchor), exclude, db_index, false, None)?;

    let mut all_folders = Vec::with_capacity(folders.len() + 1);
    all_folders.push(anchor);
    all_folders.extend(folders);
    Ok((all_folders, files))
}

fn walk_into(
    root_path: &Path,
    anchor: Arc<Entry>,
    exclude: &ExcludeManager,
    db_index: u32,
    one_file_system: bool,
    cancel: Option<&CancelToken>,
) -> Result<(Vec<Arc<Entry>>, Vec<Arc<Entry>>)> {
    let mut folders: Vec<Arc<Entry>> = Vec::new();
    let mut files: Vec<Arc<Entry>> = Vec::new();
    let mut by_path: HashMap<PathBuf, Arc<Entry>> = HashMap::new();
    by_path.insert(root_path.to_path_buf(), Arc::clone(&anchor));

    let filter_exclude = exclude.clone();
    let walker = WalkBuilder::new(root_path)
        .standard_filters(false)
        .follow_links(false)
        .same_file_system(one_file_system)
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !filter_exclude.excludes(entry.path(), &name, is_dir)
        })
        .build();

    for result in walker {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        let dir_entry = match result {
            Ok(dir_entry) => dir_entry,
            Err(error) => {
                debug!("skipping unreadable entry: {error}");
                continue;
            }
        };
        if dir_entry.depth() == 0 {
            continue;
        }
        let Some(file_type) = dir_entry.file_type() else {
            continue;
        };

        let path = dir_entry.path();
        let Some(parent) = path.parent().and_then(|p| by_path.get(p)).cloned() else {
            debug!("no indexed parent for {}", path.display());
            continue;
        };
        let meta = match dir_entry.metadata() {
            Ok(meta) => meta,
            Err(error) => {
                debug!("skipping {}: {error}", path.display());
                continue;
            }
        };
        let name = dir_entry.file_name().to_string_lossy();

        if file_type.is_dir() {
            let folder = Entry::new_folder(&name, db_index, 0, mtime_of(&meta), parent);
            by_path.insert(path.to_path_buf(), Arc::clone(&folder));
            folders.push(folder);
        } else {
            let file = Entry::new_file(&name, meta.len(), mtime_of(&meta), Arc::clone(&parent));
            propagate_size(Some(parent), meta.len() as i64);
            files.push(file);
        }
    }

    Ok((folders, files))
}

/// Modification time in Unix seconds; pre-epoch times come out negative.
pub(crate) fn mtime_of(meta: &Metadata) -> i64 {
    meta.modified().ok().map_or(0, |time| {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_secs() as i64,
            Err(before) => -(before.duration().as_secs() as i64),
        }
    })
}

/// Re-read size and mtime for a path, used by attribute-change handling.
pub(crate) fn stat_entry(path: &Path) -> Option<(u64, i64, bool)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.len(), mtime_of(&meta), meta.is_dir()))
}
