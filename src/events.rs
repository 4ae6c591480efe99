//! State-change notifications published to the embedder.
//!
//! Events are pushed onto an unbounded channel by the work-queue thread in
//! handler order, so delivery is asynchronous and ordered. The receiving end
//! is returned by [`Database::new`](crate::Database::new).

use crate::info::{DatabaseInfo, EntryInfo, SearchInfo};

#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    LoadStarted,
    LoadFinished(DatabaseInfo),
    SaveStarted,
    SaveFinished,
    ScanStarted,
    ScanFinished(DatabaseInfo),
    SearchStarted { view_id: u32 },
    SearchFinished { view_id: u32, info: SearchInfo },
    SortStarted { view_id: u32 },
    SortFinished { view_id: u32, info: SearchInfo },
    SelectionChanged { view_id: u32, info: SearchInfo },
    DatabaseChanged(DatabaseInfo),
    ItemInfoReady { view_id: u32, info: EntryInfo },
}
