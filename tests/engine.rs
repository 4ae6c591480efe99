//! End-to-end engine scenarios against real temporary directories.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use fsdb::{
    Database, DatabaseEvent, EntryInfoFlags, Error, ExcludeManager, Include, IncludeManager,
    MatchEverything, MonitorEvent, MonitorEventKind, PropertyFlags, SortDirection, SortKey,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

fn wait_for(
    events: &Receiver<DatabaseEvent>,
    mut pred: impl FnMut(&DatabaseEvent) -> bool,
) -> DatabaseEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for event");
        let event = events
            .recv_timeout(remaining)
            .expect("event stream closed or timed out");
        if pred(&event) {
            return event;
        }
    }
}

/// Poll a try-getter until the work queue is idle enough to answer.
fn entry_name(database: &Database, view_id: u32, idx: u32) -> Option<String> {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match database.try_get_item_info(view_id, idx, EntryInfoFlags::NAME) {
            Ok(info) => return info.name().map(str::to_string),
            Err(Error::EntryNotFound(_)) => return None,
            Err(Error::Busy) => {
                assert!(Instant::now() < deadline, "engine stayed busy");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(error) => panic!("unexpected error: {error}"),
        }
    }
}

fn database_counts(database: &Database) -> (u32, u32) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match database.try_get_database_info() {
            Ok(info) => return (info.num_files(), info.num_folders()),
            Err(Error::Busy) => {
                assert!(Instant::now() < deadline, "engine stayed busy");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(error) => panic!("unexpected error: {error}"),
        }
    }
}

fn view_counts(database: &Database, view_id: u32) -> (u32, u32) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        match database.try_get_search_info(view_id) {
            Ok(info) => return (info.num_files(), info.num_folders()),
            Err(Error::Busy) => {
                assert!(Instant::now() < deadline, "engine stayed busy");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(error) => panic!("unexpected error: {error}"),
        }
    }
}

struct Harness {
    data_dir: tempfile::TempDir,
    _state_dir: tempfile::TempDir,
    database: Database,
    events: Receiver<DatabaseEvent>,
}

impl Harness {
    /// Engine over a data directory holding `files` and `folders`, already
    /// loaded and scanned. The snapshot lives outside the scanned root.
    fn scanned(files: &[&str], folders: &[&str]) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        for folder in folders {
            fs::create_dir(data_dir.path().join(folder)).unwrap();
        }
        for file in files {
            fs::write(data_dir.path().join(file), file.as_bytes()).unwrap();
        }

        let (database, events) = Database::new(state_dir.path().join("fsearch.db"));
        wait_for(&events, |e| matches!(e, DatabaseEvent::LoadFinished(_)));

        database.queue_scan(Self::includes(data_dir.path().to_path_buf()), ExcludeManager::new(), PropertyFlags::default());
        wait_for(&events, |e| matches!(e, DatabaseEvent::ScanFinished(_)));

        Self {
            data_dir,
            _state_dir: state_dir,
            database,
            events,
        }
    }

    fn includes(root: PathBuf) -> IncludeManager {
        let mut includes = IncludeManager::new();
        includes.add(Include::new(root, 1).with_monitor(true));
        includes
    }
}

#[test]
fn match_everything_search_lists_folders_then_files() {
    let harness = Harness::scanned(&["a.txt", "b.txt"], &["d"]);
    harness.database.queue_search(
        1,
        Arc::new(MatchEverything),
        SortKey::Name,
        SortDirection::Ascending,
    );

    let event = wait_for(&harness.events, |e| {
        matches!(e, DatabaseEvent::SearchFinished { view_id: 1, .. })
    });
    let DatabaseEvent::SearchFinished { info, .. } = event else {
        unreachable!();
    };
    assert_eq!(info.num_files(), 2);
    assert_eq!(info.num_folders(), 1);

    assert_eq!(entry_name(&harness.database, 1, 0).as_deref(), Some("d"));
    assert_eq!(entry_name(&harness.database, 1, 1).as_deref(), Some("a.txt"));
    assert_eq!(entry_name(&harness.database, 1, 2).as_deref(), Some("b.txt"));
    assert_eq!(entry_name(&harness.database, 1, 3), None);
}

#[test]
fn live_create_joins_the_view_with_one_database_changed() {
    let harness = Harness::scanned(&["a.txt", "b.txt"], &["d"]);
    harness.database.queue_search(
        1,
        Arc::new(MatchEverything),
        SortKey::Name,
        SortDirection::Ascending,
    );
    wait_for(&harness.events, |e| {
        matches!(e, DatabaseEvent::SearchFinished { view_id: 1, .. })
    });

    fs::write(harness.data_dir.path().join("c.txt"), b"cc").unwrap();
    let monitor = harness
        .database
        .monitor_handle(1)
        .expect("index 1 is monitored");
    monitor.deliver(MonitorEvent::new(
        MonitorEventKind::Created,
        harness.data_dir.path(),
        "c.txt",
    ));

    let event = wait_for(&harness.events, |e| {
        matches!(e, DatabaseEvent::DatabaseChanged(_))
    });
    let DatabaseEvent::DatabaseChanged(info) = event else {
        unreachable!();
    };
    assert_eq!(info.num_files(), 3);

    assert_eq!(view_counts(&harness.database, 1), (3, 1));
    assert_eq!(entry_name(&harness.database, 1, 3).as_deref(), Some("c.txt"));

    // Exactly one database-changed for the batch.
    match harness.events.recv_timeout(Duration::from_millis(1200)) {
        Ok(DatabaseEvent::DatabaseChanged(_)) => panic!("second database-changed"),
        Ok(_) | Err(_) => {}
    }
}

#[test]
fn snapshot_round_trips_through_a_fresh_engine() {
    let harness = Harness::scanned(&["a.txt", "b.txt"], &["d"]);
    harness.database.queue_save();
    wait_for(&harness.events, |e| matches!(e, DatabaseEvent::SaveFinished));

    let saved_counts = database_counts(&harness.database);
    let db_file = harness._state_dir.path().join("fsearch.db");
    assert!(db_file.exists());
    drop(harness.database);

    let (restored, events) = Database::new(db_file);
    let event = wait_for(&events, |e| matches!(e, DatabaseEvent::LoadFinished(_)));
    let DatabaseEvent::LoadFinished(info) = event else {
        unreachable!();
    };
    assert_eq!((info.num_files(), info.num_folders()), saved_counts);

    // The loaded store serves searches in the same name order.
    restored.queue_search(
        4,
        Arc::new(MatchEverything),
        SortKey::Name,
        SortDirection::Ascending,
    );
    wait_for(&events, |e| {
        matches!(e, DatabaseEvent::SearchFinished { view_id: 4, .. })
    });
    assert_eq!(entry_name(&restored, 4, 0).as_deref(), Some("d"));
    assert_eq!(entry_name(&restored, 4, 1).as_deref(), Some("a.txt"));
    assert_eq!(entry_name(&restored, 4, 2).as_deref(), Some("b.txt"));
}

#[test]
fn rescanning_an_unchanged_config_is_a_no_op() {
    let harness = Harness::scanned(&["a.txt"], &[]);

    harness.database.queue_scan(
        Harness::includes(harness.data_dir.path().to_path_buf()),
        ExcludeManager::new(),
        PropertyFlags::default(),
    );
    harness.database.queue_save();

    // The save pair arrives without any second scan pair in between.
    loop {
        match harness.events.recv_timeout(EVENT_TIMEOUT).unwrap() {
            DatabaseEvent::ScanStarted | DatabaseEvent::ScanFinished(_) => {
                panic!("identical configuration must not rescan")
            }
            DatabaseEvent::SaveFinished => break,
            _ => {}
        }
    }
}

#[test]
fn descending_views_walk_from_the_other_end() {
    let harness = Harness::scanned(&["a", "b", "c"], &[]);
    harness.database.queue_search(
        2,
        Arc::new(MatchEverything),
        SortKey::Name,
        SortDirection::Descending,
    );
    wait_for(&harness.events, |e| {
        matches!(e, DatabaseEvent::SearchFinished { view_id: 2, .. })
    });

    assert_eq!(entry_name(&harness.database, 2, 0).as_deref(), Some("c"));
    assert_eq!(entry_name(&harness.database, 2, 1).as_deref(), Some("b"));
    assert_eq!(entry_name(&harness.database, 2, 2).as_deref(), Some("a"));
}

#[test]
fn sorting_a_view_by_size_reuses_the_store_order() {
    let data_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    fs::write(data_dir.path().join("small"), vec![0u8; 1]).unwrap();
    fs::write(data_dir.path().join("large"), vec![0u8; 300]).unwrap();
    fs::write(data_dir.path().join("medium"), vec![0u8; 20]).unwrap();

    let (database, events) = Database::new(state_dir.path().join("fsearch.db"));
    wait_for(&events, |e| matches!(e, DatabaseEvent::LoadFinished(_)));
    database.queue_scan(
        Harness::includes(data_dir.path().to_path_buf()),
        ExcludeManager::new(),
        PropertyFlags::default(),
    );
    wait_for(&events, |e| matches!(e, DatabaseEvent::ScanFinished(_)));

    database.queue_search(
        3,
        Arc::new(MatchEverything),
        SortKey::Name,
        SortDirection::Ascending,
    );
    wait_for(&events, |e| {
        matches!(e, DatabaseEvent::SearchFinished { view_id: 3, .. })
    });

    database.queue_sort(3, SortKey::Size, SortDirection::Ascending);
    let event = wait_for(&events, |e| {
        matches!(e, DatabaseEvent::SortFinished { view_id: 3, .. })
    });
    let DatabaseEvent::SortFinished { info, .. } = event else {
        unreachable!();
    };
    assert_eq!(info.sort_order(), SortKey::Size);

    assert_eq!(entry_name(&database, 3, 0).as_deref(), Some("small"));
    assert_eq!(entry_name(&database, 3, 1).as_deref(), Some("medium"));
    assert_eq!(entry_name(&database, 3, 2).as_deref(), Some("large"));
}

#[test]
fn selections_survive_range_toggles_and_clears() {
    let harness = Harness::scanned(&["a", "b", "c", "d"], &[]);
    harness.database.queue_search(
        6,
        Arc::new(MatchEverything),
        SortKey::Name,
        SortDirection::Ascending,
    );
    wait_for(&harness.events, |e| {
        matches!(e, DatabaseEvent::SearchFinished { view_id: 6, .. })
    });

    harness
        .database
        .queue_modify_selection(6, fsdb::SelectionChange::SelectRange(2, 0));
    let event = wait_for(&harness.events, |e| {
        matches!(e, DatabaseEvent::SelectionChanged { view_id: 6, .. })
    });
    let DatabaseEvent::SelectionChanged { info, .. } = event else {
        unreachable!();
    };
    assert_eq!(info.num_selected_files(), 3);

    harness
        .database
        .queue_modify_selection(6, fsdb::SelectionChange::ToggleRange(0, 3));
    let event = wait_for(&harness.events, |e| {
        matches!(e, DatabaseEvent::SelectionChanged { view_id: 6, .. })
    });
    let DatabaseEvent::SelectionChanged { info, .. } = event else {
        unreachable!();
    };
    assert_eq!(info.num_selected_files(), 1);
}
