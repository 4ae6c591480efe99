//! Scan configuration: which roots to index and what to leave out.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use bitflags::bitflags;
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::warn;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Entry properties collected during scans and persisted in snapshots.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlags: u64 {
        const SIZE = 1 << 0;
        const MODIFICATION_TIME = 1 << 1;
    }
}

impl Default for PropertyFlags {
    fn default() -> Self {
        Self::SIZE | Self::MODIFICATION_TIME
    }
}

/// One configured root to index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Include {
    path: PathBuf,
    id: u32,
    #[serde(default)]
    one_file_system: bool,
    #[serde(default)]
    monitor: bool,
    #[serde(default = "default_true")]
    scan_after_launch: bool,
}

fn default_true() -> bool {
    true
}

impl Include {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, id: u32) -> Self {
        Self {
            path: path.into(),
            id,
            one_file_system: false,
            monitor: false,
            scan_after_launch: true,
        }
    }

    #[must_use]
    pub fn with_one_file_system(mut self, one_file_system: bool) -> Self {
        self.one_file_system = one_file_system;
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }

    #[must_use]
    pub fn with_scan_after_launch(mut self, scan_after_launch: bool) -> Self {
        self.scan_after_launch = scan_after_launch;
        self
    }

    #[must_use]
    pub fn get_path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get_id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn get_one_file_system(&self) -> bool {
        self.one_file_system
    }

    #[must_use]
    pub fn get_monitored(&self) -> bool {
        self.monitor
    }

    #[must_use]
    pub fn get_scan_after_launch(&self) -> bool {
        self.scan_after_launch
    }
}

/// Ordered set of configured roots.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IncludeManager {
    includes: Vec<Include>,
}

impl IncludeManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, include: Include) {
        self.includes.push(include);
    }

    #[must_use]
    pub fn get_includes(&self) -> &[Include] {
        &self.includes
    }
}

/// Filters applied while scanning: glob patterns for files and directories
/// plus a hidden-entry switch. Patterns containing a separator match against
/// the full path, bare patterns against the basename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludeManager {
    file_patterns: Vec<String>,
    directory_patterns: Vec<String>,
    exclude_hidden: bool,
    #[serde(skip)]
    compiled_files: OnceLock<Option<GlobSet>>,
    #[serde(skip)]
    compiled_directories: OnceLock<Option<GlobSet>>,
}

impl PartialEq for ExcludeManager {
    fn eq(&self, other: &Self) -> bool {
        self.file_patterns == other.file_patterns
            && self.directory_patterns == other.directory_patterns
            && self.exclude_hidden == other.exclude_hidden
    }
}

impl Eq for ExcludeManager {}

impl Default for ExcludeManager {
    fn default() -> Self {
        Self {
            file_patterns: Vec::new(),
            directory_patterns: Vec::new(),
            exclude_hidden: false,
            compiled_files: OnceLock::new(),
            compiled_directories: OnceLock::new(),
        }
    }
}

impl ExcludeManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The conventional system locations nobody wants indexed.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut manager = Self::new();
        for pattern in ["/proc", "/sys", "/dev"] {
            manager.add_directory_pattern(pattern);
        }
        manager
    }

    pub fn add_file_pattern(&mut self, pattern: impl Into<String>) {
        self.file_patterns.push(pattern.into());
        self.compiled_files = OnceLock::new();
    }

    pub fn add_directory_pattern(&mut self, pattern: impl Into<String>) {
        self.directory_patterns.push(pattern.into());
        self.compiled_directories = OnceLock::new();
    }

    pub fn set_exclude_hidden(&mut self, exclude_hidden: bool) {
        self.exclude_hidden = exclude_hidden;
    }

    #[must_use]
    pub fn get_exclude_hidden(&self) -> bool {
        self.exclude_hidden
    }

    /// Whether `path` with basename `name` should be left out of the index.
    #[must_use]
    pub fn excludes(&self, path: &Path, name: &str, is_dir: bool) -> bool {
        if self.exclude_hidden && name.starts_with('.') {
            return true;
        }
        let set = if is_dir {
            self.compiled_directories
                .get_or_init(|| compile_patterns(&self.directory_patterns))
        } else {
            self.compiled_files
                .get_or_init(|| compile_patterns(&self.file_patterns))
        };
        match set {
            Some(set) => set.is_match(name) || set.is_match(path),
            None => false,
        }
    }

    /// Convenience form used by callers that only have a path.
    #[must_use]
    pub fn matches(&self, path: &Path, is_dir: bool) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.excludes(path, &name, is_dir)
    }
}

fn compile_patterns(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(error) => warn!("ignoring bad exclude pattern {pattern:?}: {error}"),
        }
    }
    builder.build().ok()
}
