//! End-to-end flows through the sync engine with in-memory stores.

use chrono::Duration;
use ladder_core::clock::{Clock, ManualClock};
use ladder_core::config::SyncConfig;
use ladder_core::drag::DragSession;
use ladder_core::error::ErrorCode;
use ladder_core::model::codec;
use ladder_core::model::{Level, NewTask};
use ladder_core::store::{
    LocalStore, MemoryLocalStore, MemoryRemoteStore, RemoteDocument, RemoteFault, RemoteStore, SetOptions,
};
use ladder_core::sync::{Backend, Identity, MutationOutcome, Phase, SyncEngine};
use ladder_core::tree;
use std::sync::Arc;

type Engine = SyncEngine<MemoryLocalStore, MemoryRemoteStore>;

fn engine_with(remote: MemoryRemoteStore) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::from_millis(1_700_000_000_000));
    let local = MemoryLocalStore::new(clock.clone());
    let engine = SyncEngine::new(SyncConfig::default(), local, remote, clock.clone()).unwrap();
    (engine, clock)
}

fn signed_out() -> (Engine, Arc<ManualClock>) {
    let (mut engine, clock) = engine_with(MemoryRemoteStore::new());
    engine.on_identity(&Identity::Anonymous);
    (engine, clock)
}

fn user(id: &str) -> Identity {
    Identity::Authenticated(id.to_string())
}

fn seed_ladder(engine: &mut Engine, clock: &ManualClock) {
    assert!(engine.add_task(NewTask::goal("Launch product").with_id("g1")).is_applied());
    clock.advance(Duration::seconds(1));
    assert!(
        engine
            .add_task(NewTask::child("g1", Level::Metric, "Sign up 100 users").with_id("m1"))
            .is_applied()
    );
    clock.advance(Duration::seconds(1));
    assert!(
        engine
            .add_task(NewTask::child("m1", Level::Action, "Write landing page").with_id("a1"))
            .is_applied()
    );
    clock.advance(Duration::seconds(1));
}

#[test]
fn ladder_toggle_and_undo() {
    let (mut engine, clock) = signed_out();
    seed_ladder(&mut engine, &clock);

    let g1 = &engine.tasks()[0];
    assert_eq!(g1.id, "g1");
    assert_eq!(g1.children.len(), 1);
    assert_eq!(g1.children[0].id, "m1");
    assert_eq!(g1.children[0].order, 0);
    assert_eq!(g1.children[0].children[0].id, "a1");

    engine.toggle_task("a1");
    let m1 = tree::find(engine.tasks(), "m1").unwrap();
    assert!(!m1.completed);
    assert!(tree::find(engine.tasks(), "a1").unwrap().completed);

    // Un-complete a1 so the cascade from m1 is observable.
    clock.advance(Duration::seconds(1));
    engine.toggle_task("a1");
    let before_m1 = engine.tasks().clone();

    clock.advance(Duration::seconds(1));
    engine.toggle_task("m1");
    let m1 = tree::find(engine.tasks(), "m1").unwrap();
    let a1 = tree::find(engine.tasks(), "a1").unwrap();
    assert!(m1.completed);
    assert!(a1.completed);
    assert_eq!(m1.updated_at, a1.updated_at);

    assert!(engine.undo().is_applied());
    assert_eq!(engine.tasks(), &before_m1);
    assert!(engine.can_redo());
}

#[test]
fn action_onto_goal_is_rejected() {
    let (mut engine, clock) = signed_out();
    seed_ladder(&mut engine, &clock);
    let before = engine.tasks().clone();
    let undo_before = engine.history().undo_len();

    let mut session = DragSession::new();
    session.start("a1");
    assert!(!session.over(engine.tasks(), Some("g1")));
    assert!(!session.hover().unwrap().droppable);

    let outcome = engine.end_drag(&mut session, Some("g1"));
    assert!(matches!(outcome, MutationOutcome::NoOp(ref r) if r.code == ErrorCode::IllegalDrop));
    assert_eq!(engine.tasks(), &before);
    assert_eq!(engine.history().undo_len(), undo_before);
    assert!(!session.is_dragging());
    assert!(session.hover().is_none());
}

#[test]
fn first_sign_in_migrates_local_tasks_once() {
    let remote = MemoryRemoteStore::new();
    let (mut engine, clock) = engine_with(remote.clone());
    engine.on_identity(&Identity::Anonymous);
    seed_ladder(&mut engine, &clock);

    engine.on_identity(&user("u1"));
    assert_eq!(engine.phase(), &Phase::Remote { user: "u1".into() });
    assert_eq!(remote.stats().upserts, 3);
    assert_eq!(engine.local().get("tasks").unwrap(), None);
    assert_eq!(
        engine.local().get("tasks_migrated_to_remote").unwrap().as_deref(),
        Some("true")
    );
    let report = engine.last_migration().unwrap();
    assert_eq!(report.attempted, 3);
    assert!(report.failures.is_empty());

    // The first snapshot rebuilds the same ladder from flat documents.
    assert_eq!(tree::count(engine.tasks()), 3);
    assert!(tree::check_shape(engine.tasks()).is_empty());

    // Same device, later session: flag already set, nothing re-uploaded.
    let flag = engine.local().get("tasks_migrated_to_remote").unwrap().unwrap();
    let clock = Arc::new(ManualClock::from_millis(1_800_000_000_000));
    let mut local = MemoryLocalStore::new(clock.clone());
    local
        .set("tasks_migrated_to_remote", &flag, Default::default())
        .unwrap();
    let mut again = SyncEngine::new(SyncConfig::default(), local, remote.clone(), clock).unwrap();
    again.on_identity(&user("u1"));
    assert_eq!(remote.stats().upserts, 3);
    assert_eq!(tree::count(again.tasks()), 3);
}

#[test]
fn empty_local_sign_in_writes_nothing() {
    let remote = MemoryRemoteStore::new();
    let (mut engine, _) = engine_with(remote.clone());
    engine.on_identity(&user("u1"));
    assert_eq!(engine.backend(), Backend::Remote);
    assert_eq!(remote.stats().upserts, 0);
    assert!(engine.last_migration().is_none());
}

#[test]
fn sign_in_migrates_tasks_the_local_store_failed_to_save() {
    let remote = MemoryRemoteStore::new();
    let (mut engine, _) = engine_with(remote.clone());
    engine.on_identity(&Identity::Anonymous);
    engine.local_mut().set_failing(true);
    let outcome = engine.add_task(NewTask::goal("Unsaved").with_id("g1"));
    assert_eq!(outcome.report().unwrap().failures.len(), 1);
    engine.local_mut().set_failing(false);

    engine.on_identity(&user("u1"));
    assert_eq!(engine.phase(), &Phase::Remote { user: "u1".into() });
    assert_eq!(engine.last_migration().unwrap().attempted, 1);
    assert_eq!(remote.documents("u1").len(), 1);
    assert_eq!(tree::count(engine.tasks()), 1);
    assert_eq!(engine.tasks()[0].id, "g1");
}

#[test]
fn failed_migration_is_retried_on_next_event() {
    let remote = MemoryRemoteStore::new();
    let (mut engine, clock) = engine_with(remote.clone());
    engine.on_identity(&Identity::Anonymous);
    seed_ladder(&mut engine, &clock);

    remote.set_fault(RemoteFault {
        reject_ids: ["m1".to_string()].into_iter().collect(),
        ..RemoteFault::default()
    });
    engine.on_identity(&user("u1"));
    assert_eq!(engine.phase(), &Phase::PendingMigration { user: "u1".into() });
    assert_eq!(engine.backend(), Backend::Local);
    assert!(engine.local().get("tasks").unwrap().is_some());
    assert_eq!(engine.last_sync_error().unwrap().code, ErrorCode::MigrationFailed);

    // Edits keep going to the local store meanwhile.
    assert_eq!(
        engine.add_task(NewTask::goal("Hire").with_id("g2")).report().unwrap().backend,
        Backend::Local
    );

    remote.set_fault(RemoteFault::default());
    engine.on_identity(&user("u1"));
    assert_eq!(engine.phase(), &Phase::Remote { user: "u1".into() });
    assert_eq!(remote.documents("u1").len(), 4);
    assert_eq!(tree::count(engine.tasks()), 4);
}

#[test]
fn sign_out_clears_session() {
    let (mut engine, clock) = engine_with(MemoryRemoteStore::new());
    engine.on_identity(&user("u1"));
    seed_ladder(&mut engine, &clock);
    assert!(engine.can_undo());
    assert!(engine.is_subscribed());

    engine.on_identity(&Identity::Anonymous);
    assert_eq!(engine.phase(), &Phase::Local);
    assert!(engine.tasks().is_empty());
    assert!(!engine.can_undo());
    assert!(!engine.is_subscribed());
    assert_eq!(engine.remote().subscriber_count(), 0);
    assert_eq!(engine.local().get("tasks_migrated_to_remote").unwrap(), None);
    assert_eq!(engine.local().get("tasks_history").unwrap(), None);

    // Signing back in picks the remote copy up again.
    engine.on_identity(&user("u1"));
    assert_eq!(tree::count(engine.tasks()), 3);
}

#[test]
fn remote_edits_from_another_session_win() {
    let remote = MemoryRemoteStore::new();
    let (mut engine, clock) = engine_with(remote.clone());
    engine.on_identity(&user("u1"));
    seed_ladder(&mut engine, &clock);
    engine.pump_remote();

    let mut foreign = tree::find(engine.tasks(), "g1").unwrap().to_record();
    foreign.title = "Launch v2".into();
    remote.upsert("u1", &foreign).unwrap();

    assert!(engine.pump_remote());
    assert_eq!(tree::find(engine.tasks(), "g1").unwrap().title, "Launch v2");
    assert_eq!(tree::count(engine.tasks()), 3);
}

#[test]
fn echo_of_own_write_changes_nothing() {
    let (mut engine, clock) = engine_with(MemoryRemoteStore::new());
    engine.on_identity(&user("u1"));
    seed_ladder(&mut engine, &clock);
    engine.pump_remote();
    engine.toggle_task("a1");
    let optimistic = engine.tasks().clone();
    assert!(!engine.pump_remote());
    assert_eq!(engine.tasks(), &optimistic);
}

#[test]
fn malformed_documents_do_not_block_snapshot() {
    let remote = MemoryRemoteStore::new();
    remote.put_raw(
        "u1",
        RemoteDocument {
            id: "g1".into(),
            data: serde_json::json!({"title": "Launch", "level": "goal", "order": 0}),
        },
    );
    remote.put_raw(
        "u1",
        RemoteDocument {
            id: "junk".into(),
            data: serde_json::json!(["not", "a", "task"]),
        },
    );
    remote.put_raw(
        "u1",
        RemoteDocument {
            id: "m1".into(),
            data: serde_json::json!({"title": "Users", "level": "kpi", "parentId": "g1"}),
        },
    );
    remote.put_raw(
        "u1",
        RemoteDocument {
            id: "orphan".into(),
            data: serde_json::json!({"title": "Lost", "level": "goal", "parentId": "nowhere"}),
        },
    );

    let (mut engine, _) = engine_with(remote);
    engine.on_identity(&user("u1"));
    let roots: Vec<_> = engine.tasks().iter().map(|t| t.id.as_str()).collect();
    assert_eq!(roots, ["g1", "orphan"]);
    assert_eq!(engine.tasks()[0].children[0].id, "m1");
}

#[test]
fn remote_failure_keeps_optimistic_tree() {
    let remote = MemoryRemoteStore::new();
    let (mut engine, clock) = engine_with(remote.clone());
    engine.on_identity(&user("u1"));
    seed_ladder(&mut engine, &clock);

    remote.set_offline(true);
    let outcome = engine.delete_task("m1");
    let report = outcome.report().unwrap();
    assert!(!report.is_clean());
    assert_eq!(report.deleted, 0);
    assert_eq!(tree::count(engine.tasks()), 1);
    assert_eq!(engine.last_sync_error().unwrap().code, ErrorCode::RemoteWriteFailed);
    assert_eq!(remote.documents("u1").len(), 3);
}

#[test]
fn local_blob_round_trips_through_restart() {
    let clock = Arc::new(ManualClock::from_millis(1_700_000_000_000));
    let mut engine = SyncEngine::new(
        SyncConfig::default(),
        MemoryLocalStore::new(clock.clone()),
        MemoryRemoteStore::new(),
        clock.clone(),
    )
    .unwrap();
    engine.on_identity(&Identity::Anonymous);
    seed_ladder(&mut engine, &clock);

    let blob = engine.local().get("tasks").unwrap().unwrap();
    let decoded = codec::decode_tree(&blob, clock.now());
    assert_eq!(&decoded, engine.tasks());
}

#[test]
fn expired_local_blob_loads_empty() {
    let clock = Arc::new(ManualClock::from_millis(1_700_000_000_000));
    let mut local = MemoryLocalStore::new(clock.clone());
    let blob = r#"[{"id":"g1","title":"Old","level":"goal"}]"#;
    local.set("tasks", blob, SetOptions::expiring_in(1)).unwrap();
    clock.advance(Duration::days(2));

    let mut engine = SyncEngine::new(SyncConfig::default(), local, MemoryRemoteStore::new(), clock).unwrap();
    engine.on_identity(&Identity::Anonymous);
    assert!(engine.tasks().is_empty());
}
