use siphon_lib::{LinkKey, OpParams, TaskKind, TaskStatus};
use siphon_taskdb::TaskStore;
use tempfile::tempdir;

fn transfer_link(src: &str, dst: &str) -> LinkKey {
    LinkKey::Transfer {
        source_site: src.to_string(),
        dest_site: dst.to_string(),
    }
}

fn deletion_link(site: &str) -> LinkKey {
    LinkKey::Deletion {
        site: site.to_string(),
    }
}

fn transfer_params(n: u32) -> OpParams {
    OpParams::Transfer {
        source: format!("gsiftp://src/store/file{n}"),
        destination: format!("gsiftp://dst/store/file{n}"),
    }
}

fn deletion_params(n: u32) -> OpParams {
    OpParams::Deletion {
        file: format!("gsiftp://site/store/file{n}"),
    }
}

fn open_store() -> (tempfile::TempDir, TaskStore) {
    let dir = tempdir().unwrap();
    let store = TaskStore::open_or_create(&dir.path().join("tasks.sqlite")).unwrap();
    (dir, store)
}

#[test]
fn fetch_new_groups_rows_by_link_then_id() {
    let (_dir, store) = open_store();

    let ab = store.insert_batch(&transfer_link("A", "B")).unwrap();
    let cd = store.insert_batch(&transfer_link("C", "D")).unwrap();

    // Interleave insertion across the two links.
    let t1 = store.insert_task(&transfer_params(1), ab).unwrap();
    let t2 = store.insert_task(&transfer_params(2), cd).unwrap();
    let t3 = store.insert_task(&transfer_params(3), ab).unwrap();
    let t4 = store.insert_task(&transfer_params(4), cd).unwrap();

    let rows = store.fetch_new(TaskKind::Transfer).unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![t1, t3, t2, t4]);

    // Rows sharing a link are contiguous and carry that link.
    assert_eq!(rows[0].link, transfer_link("A", "B"));
    assert_eq!(rows[1].link, transfer_link("A", "B"));
    assert_eq!(rows[2].link, transfer_link("C", "D"));
    assert_eq!(rows[3].link, transfer_link("C", "D"));
}

#[test]
fn fetch_new_skips_rows_past_new() {
    let (_dir, store) = open_store();

    let batch = store.insert_batch(&deletion_link("SITE")).unwrap();
    let keep = store.insert_task(&deletion_params(1), batch).unwrap();
    let queued = store.insert_task(&deletion_params(2), batch).unwrap();
    let done = store.insert_task(&deletion_params(3), batch).unwrap();

    store
        .set_status(TaskKind::Deletion, queued, TaskStatus::Queued)
        .unwrap();
    store
        .set_outcome(TaskKind::Deletion, done, TaskStatus::Done, 0, 100, 200)
        .unwrap();

    let rows = store.fetch_new(TaskKind::Deletion).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, keep);
    assert_eq!(rows[0].params, deletion_params(1));
}

#[test]
fn outcome_round_trips_exit_code_and_timestamps() {
    let (_dir, store) = open_store();

    let batch = store.insert_batch(&transfer_link("A", "B")).unwrap();
    let id = store.insert_task(&transfer_params(1), batch).unwrap();

    let started = 1_700_000_000;
    let finished = 1_700_000_042;
    store
        .set_outcome(TaskKind::Transfer, id, TaskStatus::Done, 0, started, finished)
        .unwrap();

    let row = store.get_task(TaskKind::Transfer, id).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Done);
    assert_eq!(row.exit_code, Some(0));
    assert_eq!(row.start_time, started);
    assert_eq!(row.finish_time, finished);
    assert!(row.start_time <= row.finish_time);
}

#[test]
fn zero_timestamps_store_as_null() {
    let (_dir, store) = open_store();

    let batch = store.insert_batch(&deletion_link("SITE")).unwrap();
    let id = store.insert_task(&deletion_params(1), batch).unwrap();

    // Internal errors record failed with exit -1 and no timestamps.
    store
        .set_outcome(TaskKind::Deletion, id, TaskStatus::Failed, -1, 0, 0)
        .unwrap();

    let row = store.get_task(TaskKind::Deletion, id).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert_eq!(row.exit_code, Some(-1));
    assert_eq!(row.start_time, 0);
    assert_eq!(row.finish_time, 0);
}

#[test]
fn list_queued_tracks_queued_rows_only() {
    let (_dir, store) = open_store();

    let batch = store.insert_batch(&transfer_link("A", "B")).unwrap();
    let q1 = store.insert_task(&transfer_params(1), batch).unwrap();
    let q2 = store.insert_task(&transfer_params(2), batch).unwrap();
    let active = store.insert_task(&transfer_params(3), batch).unwrap();

    store
        .set_status(TaskKind::Transfer, q1, TaskStatus::Queued)
        .unwrap();
    store
        .set_status(TaskKind::Transfer, q2, TaskStatus::Queued)
        .unwrap();
    store
        .set_status(TaskKind::Transfer, active, TaskStatus::Active)
        .unwrap();

    let queued = store.list_queued(TaskKind::Transfer).unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.contains(&q1));
    assert!(queued.contains(&q2));
    assert!(!queued.contains(&active));

    // Kinds are segregated.
    assert!(store.list_queued(TaskKind::Deletion).unwrap().is_empty());
}

#[test]
fn recover_orphans_resets_queued_and_active() {
    let (_dir, store) = open_store();

    let tb = store.insert_batch(&transfer_link("A", "B")).unwrap();
    let db = store.insert_batch(&deletion_link("SITE")).unwrap();

    // Three active, two queued, as left behind by an unclean stop.
    let mut orphans = Vec::new();
    for n in 0..3 {
        let id = store.insert_task(&transfer_params(n), tb).unwrap();
        store
            .set_status(TaskKind::Transfer, id, TaskStatus::Active)
            .unwrap();
        orphans.push((TaskKind::Transfer, id));
    }
    for n in 0..2 {
        let id = store.insert_task(&deletion_params(n), db).unwrap();
        store
            .set_status(TaskKind::Deletion, id, TaskStatus::Queued)
            .unwrap();
        orphans.push((TaskKind::Deletion, id));
    }
    // Terminal rows must survive recovery untouched.
    let done = store.insert_task(&transfer_params(9), tb).unwrap();
    store
        .set_outcome(TaskKind::Transfer, done, TaskStatus::Done, 0, 1, 2)
        .unwrap();

    assert_eq!(store.recover_orphans().unwrap(), 5);
    for (kind, id) in orphans {
        let row = store.get_task(kind, id).unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::New);
    }
    let row = store.get_task(TaskKind::Transfer, done).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Done);
}

#[test]
fn recover_orphans_is_idempotent() {
    let (_dir, store) = open_store();

    let batch = store.insert_batch(&transfer_link("A", "B")).unwrap();
    let id = store.insert_task(&transfer_params(1), batch).unwrap();
    store
        .set_status(TaskKind::Transfer, id, TaskStatus::Queued)
        .unwrap();

    assert_eq!(store.recover_orphans().unwrap(), 1);
    assert_eq!(store.recover_orphans().unwrap(), 0);

    let row = store.get_task(TaskKind::Transfer, id).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::New);
}

#[test]
fn get_task_missing_row_is_none() {
    let (_dir, store) = open_store();
    assert!(store.get_task(TaskKind::Transfer, 4242).unwrap().is_none());
}
