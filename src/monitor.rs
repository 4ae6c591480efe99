//! Intake for filesystem monitor backends.
//!
//! The engine does not ship an inotify/fanotify/FSEvents backend; whatever
//! watches the filesystem obtains a [`MonitorHandle`] for a root index and
//! delivers raw events through it. Delivery hops through the store's monitor
//! context, so backends may call from any thread while the index sees a
//! single ordered stream.

use std::path::PathBuf;
use std::sync::mpsc::Sender;

use crate::context::TaskContextHandle;

/// What happened to `<parent>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEventKind {
    /// A file or directory appeared (creation, or move-in from outside the
    /// watched tree).
    Created,
    /// A file or directory disappeared (deletion, or move-out).
    Deleted,
    /// Renamed within the same directory.
    Renamed { new_name: String },
    /// Moved to a different watched directory.
    Moved {
        to_parent: PathBuf,
        to_name: String,
    },
    /// Metadata changed (chmod, utimes, truncate).
    AttributeChanged,
    /// A writer closed the file; size or mtime may have changed.
    ContentChanged,
    /// The backend lost the ability to watch this root. The index stops
    /// monitoring and is removed from the store.
    Failed,
}

#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub kind: MonitorEventKind,
    /// Directory containing the affected entry; must be inside the watched
    /// root (or the root itself).
    pub parent: PathBuf,
    /// Basename of the affected entry. Unused for [`MonitorEventKind::Failed`].
    pub name: String,
    /// Whether the affected entry is a directory, where the backend knows.
    pub is_dir: bool,
}

impl MonitorEvent {
    #[must_use]
    pub fn new(kind: MonitorEventKind, parent: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            kind,
            parent: parent.into(),
            name: name.into(),
            is_dir: false,
        }
    }

    #[must_use]
    pub fn directory(mut self) -> Self {
        self.is_dir = true;
        self
    }

    /// Convenience constructor for backends reporting loss of the watch.
    #[must_use]
    pub fn failed() -> Self {
        Self {
            kind: MonitorEventKind::Failed,
            parent: PathBuf::new(),
            name: String::new(),
            is_dir: false,
        }
    }
}

/// Write end of one root index's monitor queue.
#[derive(Clone)]
pub struct MonitorHandle {
    event_tx: Sender<MonitorEvent>,
    monitor_ctx: TaskContextHandle,
}

impl MonitorHandle {
    pub(crate) fn new(event_tx: Sender<MonitorEvent>, monitor_ctx: TaskContextHandle) -> Self {
        Self {
            event_tx,
            monitor_ctx,
        }
    }

    /// Queue one raw event. Events are applied in delivery order the next
    /// time the index drains its queue; nothing happens until the index is
    /// monitoring.
    pub fn deliver(&self, event: MonitorEvent) {
        let event_tx = self.event_tx.clone();
        self.monitor_ctx.post(move || {
            let _ = event_tx.send(event);
        });
    }
}
