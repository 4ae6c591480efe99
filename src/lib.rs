//! fsdb — the core of a fast file-search engine.
//!
//! An in-memory, sorted, queryable index of filesystem subtrees. Per-root
//! indices scan and watch their trees; the index store aggregates them into
//! pre-sorted containers per sort key; a single work queue serializes loads,
//! saves, scans, searches, sorts and selection changes; results materialise
//! as named search views that follow live filesystem changes. State persists
//! to a compact binary snapshot with delta-encoded names.

pub mod app_dirs;
mod cancel;
mod config;
mod container;
mod context;
mod engine;
mod entry;
mod error;
mod events;
mod index;
mod info;
mod monitor;
mod query;
mod scan;
mod search;
mod snapshot;
mod sort;
mod store;
mod thread_pool;
mod view;
mod work;

pub use cancel::CancelToken;
pub use config::{ExcludeManager, Include, IncludeManager, PropertyFlags};
pub use container::EntriesContainer;
pub use engine::Database;
pub use entry::{Entry, EntryKind};
pub use error::{Error, Result};
pub use events::DatabaseEvent;
pub use index::{IndexEvent, IndexState, RootIndex};
pub use info::{DatabaseInfo, EntryInfo, EntryInfoFlags, SearchInfo};
pub use monitor::{MonitorEvent, MonitorEventKind, MonitorHandle};
pub use query::{MatchEverything, NameContains, Query};
pub use sort::{NUM_SORT_KEYS, SortDirection, SortKey};
pub use store::IndexStore;
pub use thread_pool::ThreadPool;
pub use view::SelectionChange;
