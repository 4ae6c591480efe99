//! Typed work items drained serially by the engine's queue thread.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::{ExcludeManager, IncludeManager, PropertyFlags};
use crate::index::IndexEvent;
use crate::info::EntryInfoFlags;
use crate::query::Query;
use crate::sort::{SortDirection, SortKey};
use crate::view::SelectionChange;

pub(crate) enum Work {
    Load {
        cancel: CancelToken,
    },
    Save,
    Scan {
        includes: IncludeManager,
        excludes: ExcludeManager,
        flags: PropertyFlags,
        cancel: CancelToken,
    },
    Rescan {
        cancel: CancelToken,
    },
    Search {
        view_id: u32,
        query: Arc<dyn Query>,
        sort_order: SortKey,
        direction: SortDirection,
        cancel: CancelToken,
    },
    Sort {
        view_id: u32,
        sort_order: SortKey,
        direction: SortDirection,
        cancel: CancelToken,
    },
    ModifySelection {
        view_id: u32,
        change: SelectionChange,
    },
    GetItemInfo {
        view_id: u32,
        idx: u32,
        flags: EntryInfoFlags,
    },
    /// A bracketed batch of index events, forwarded by the store's worker
    /// tick.
    MonitorBatch {
        index_id: u32,
        events: Vec<IndexEvent>,
    },
    Quit,
}
