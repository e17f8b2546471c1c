//! Integration tests for the full write/query path: vault, index,
//! consistency manager, hierarchy, and reconciliation working together.

use chrono::NaiveDate;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskvault_core::{
    hierarchy::CascadePolicy, models::Entity, spawn_reconciler, CompletionPolicy, Config,
    CoreError, NewProject, NewTask, Position, ProjectCascade, Status, Store, TaskPatch,
};
use taskvault_types::VaultChange;

fn open_store() -> (tempfile::TempDir, Store) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(Config::with_vault(dir.path().join("vault"))).unwrap();
    (dir, store)
}

fn home_project(store: &Store) {
    store
        .create_project(NewProject {
            title: "Home".into(),
            ..NewProject::default()
        })
        .unwrap();
}

#[test]
fn test_create_task_scenario() {
    let (_dir, store) = open_store();
    home_project(&store);

    let mut new = NewTask::new("Pick up dry cleaning", "home");
    new.due = NaiveDate::from_ymd_opt(2025, 9, 2);
    new.priority = Some(taskvault_core::Priority::Med);
    let applied = store.create_task(new).unwrap();
    assert!(applied.warning.is_none());

    let task = applied.value;
    assert_eq!(task.slug, "pick-up-dry-cleaning");
    assert_eq!(task.status, Status::Todo);

    // The file is on disk at the derived path.
    let path = store.vault().resolve_path(&Entity::Task(task.clone()));
    assert!(path.exists());
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .contains("pick-up-dry-cleaning"));

    // And the index already answers for it.
    let ids = store.run_query("project:home status:todo").unwrap();
    assert_eq!(ids, vec![task.id]);
}

#[test]
fn test_cycle_rejection_leaves_state_unchanged() {
    let (_dir, store) = open_store();
    home_project(&store);

    let a = store.create_task(NewTask::new("A", "home")).unwrap().value;
    let mut new_b = NewTask::new("B", "home");
    new_b.parent = Some(a.id.to_string());
    let b = store.create_task(new_b).unwrap().value;

    let err = store
        .reparent(a.id.as_str(), Some(b.id.as_str()), false)
        .unwrap_err();
    assert!(matches!(err, CoreError::CycleDetected { .. }));

    // A is still top-level, in the file and in the index.
    let reread = store.get_task(a.id.as_str()).unwrap();
    assert!(reread.parent.is_none());
    let top_level = store.run_query("project:home parent:none").unwrap();
    assert!(top_level.contains(&a.id));
}

#[test]
fn test_due_inheritance_orders_parent_with_children() {
    let (_dir, store) = open_store();
    home_project(&store);

    let parent = store
        .create_task(NewTask::new("Plan the move", "home"))
        .unwrap()
        .value;
    for (title, day) in [("Book movers", 1), ("Pack boxes", 5)] {
        let mut new = NewTask::new(title, "home");
        new.parent = Some(parent.id.to_string());
        new.due = NaiveDate::from_ymd_opt(2025, 9, day);
        store.create_task(new).unwrap();
    }
    let mut other = NewTask::new("Dentist", "home");
    other.due = NaiveDate::from_ymd_opt(2025, 9, 3);
    let other = store.create_task(other).unwrap().value;

    // The parent has no due date of its own but inherits 2025-09-05, so it
    // sorts after the 2025-09-03 task.
    assert_eq!(
        store.effective_due(parent.id.as_str()).unwrap(),
        NaiveDate::from_ymd_opt(2025, 9, 5)
    );
    let ids = store.run_query("parent:none sort:due").unwrap();
    let dentist = ids.iter().position(|id| *id == other.id).unwrap();
    let mover = ids.iter().position(|id| *id == parent.id).unwrap();
    assert!(dentist < mover);
}

#[test]
fn test_completion_rollup_and_policies() {
    let (_dir, store) = open_store();
    home_project(&store);

    let parent = store
        .create_task(NewTask::new("Parent", "home"))
        .unwrap()
        .value;
    let mut child_ids = Vec::new();
    for title in ["C1", "C2"] {
        let mut new = NewTask::new(title, "home");
        new.parent = Some(parent.id.to_string());
        child_ids.push(store.create_task(new).unwrap().value.id);
    }

    store
        .set_status(child_ids[0].as_str(), Status::Done, None)
        .unwrap();
    assert_eq!(store.completion(parent.id.as_str()).unwrap(), Some(0.5));

    // Default policy blocks completing the parent over an open child.
    let err = store
        .set_status(parent.id.as_str(), Status::Done, None)
        .unwrap_err();
    assert!(matches!(err, CoreError::HasChildren { .. }));
    assert_eq!(store.get_task(parent.id.as_str()).unwrap().status, Status::Todo);

    // Cascade completes the open descendants too.
    store
        .set_status(
            parent.id.as_str(),
            Status::Done,
            Some(CompletionPolicy::Cascade),
        )
        .unwrap();
    assert_eq!(store.completion(parent.id.as_str()).unwrap(), Some(1.0));
    assert_eq!(
        store.get_task(child_ids[1].as_str()).unwrap().status,
        Status::Done
    );
}

#[test]
fn test_reorder_and_promote() {
    let (_dir, store) = open_store();
    home_project(&store);

    let first = store.create_task(NewTask::new("First", "home")).unwrap().value;
    let second = store
        .create_task(NewTask::new("Second", "home"))
        .unwrap()
        .value;
    let third = store.create_task(NewTask::new("Third", "home")).unwrap().value;

    store
        .reorder(third.id.as_str(), Position::Before(first.id.to_string()))
        .unwrap();
    let ids = store.run_query("parent:none sort:position").unwrap();
    assert_eq!(ids, vec![third.id.clone(), first.id.clone(), second.id.clone()]);

    // Demote then promote: promoted tasks land at the end of the top level.
    store
        .reparent(third.id.as_str(), Some(first.id.as_str()), false)
        .unwrap();
    store.promote(third.id.as_str()).unwrap();
    let ids = store.run_query("parent:none sort:position").unwrap();
    assert_eq!(ids.last(), Some(&third.id));
}

#[test]
fn test_delete_with_children_policies() {
    let (_dir, store) = open_store();
    home_project(&store);

    let parent = store.create_task(NewTask::new("Parent", "home")).unwrap().value;
    let mut new = NewTask::new("Child", "home");
    new.parent = Some(parent.id.to_string());
    let child = store.create_task(new).unwrap().value;

    let err = store
        .delete(parent.id.as_str(), CascadePolicy::Refuse)
        .unwrap_err();
    assert!(matches!(err, CoreError::HasChildren { .. }));

    // Reassign-to-grandparent keeps the child alive at the top level.
    store
        .delete(parent.id.as_str(), CascadePolicy::ReassignToGrandparent)
        .unwrap();
    let survivor = store.get_task(child.id.as_str()).unwrap();
    assert!(survivor.parent.is_none());
    assert!(matches!(
        store.get_task(parent.id.as_str()),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn test_rebuild_answers_queries_identically() {
    let (_dir, store) = open_store();
    home_project(&store);

    for (i, title) in ["Alpha", "Beta", "Gamma", "Delta"].iter().enumerate() {
        let mut new = NewTask::new(*title, "home");
        new.due = NaiveDate::from_ymd_opt(2025, 10, (i + 1) as u32);
        new.tags = vec!["batch".into()];
        store.create_task(new).unwrap();
    }
    store
        .set_status("beta", Status::Done, None)
        .unwrap();

    let queries = [
        "project:home",
        "status:todo tag:batch sort:due",
        "status:done",
        "alpha",
    ];
    let before: Vec<_> = queries
        .iter()
        .map(|q| store.run_query(q).unwrap())
        .collect();

    let stats = store.reindex().unwrap();
    assert_eq!(stats.indexed_tasks, 4);
    assert_eq!(stats.indexed_projects, 1);

    let after: Vec<_> = queries
        .iter()
        .map(|q| store.run_query(q).unwrap())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn test_desync_recovery_after_index_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_vault(dir.path().join("vault"));
    let index_path = config.index_path();

    let task_id = {
        let store = Store::open(config.clone()).unwrap();
        home_project(&store);
        let task = store
            .create_task(NewTask::new("Survives corruption", "home"))
            .unwrap()
            .value;
        task.id
    };

    // Clobber the index out of band. The vault is untouched, so reopening
    // must rebuild and answer correctly without manual intervention.
    fs::write(&index_path, b"this is not a database").unwrap();
    let _ = fs::remove_file(index_path.with_extension("db-wal"));

    let store = Store::open(config).unwrap();
    let ids = store.run_query("project:home").unwrap();
    assert_eq!(ids, vec![task_id]);
}

#[test]
fn test_external_edit_is_reconciled() {
    let (_dir, store) = open_store();
    home_project(&store);

    let task = store
        .create_task(NewTask::new("Buy groceries", "home"))
        .unwrap()
        .value;
    let path = store.vault().resolve_path(&Entity::Task(task.clone()));

    // Someone edits the title straight in the file.
    let raw = fs::read_to_string(&path).unwrap();
    fs::write(
        &path,
        raw.replace("title: Buy groceries", "title: Buy groceries and batteries"),
    )
    .unwrap();

    // Before reconciliation the index still has the old title.
    assert!(store.run_query("batteries").unwrap().is_empty());

    store
        .reconcile(&VaultChange::Upserted { path })
        .unwrap();
    assert_eq!(store.run_query("batteries").unwrap(), vec![task.id]);
}

#[test]
fn test_external_delete_is_reconciled() {
    let (_dir, store) = open_store();
    home_project(&store);

    let task = store.create_task(NewTask::new("Transient", "home")).unwrap().value;
    let path = store.vault().resolve_path(&Entity::Task(task.clone()));
    fs::remove_file(&path).unwrap();

    store.reconcile(&VaultChange::Removed { path }).unwrap();
    assert!(store.run_query("project:home").unwrap().is_empty());
}

#[test]
fn test_watcher_picks_up_out_of_band_edits() {
    let (_dir, store) = open_store();
    home_project(&store);
    let task = store
        .create_task(NewTask::new("Watched task", "home"))
        .unwrap()
        .value;
    let path = store.vault().resolve_path(&Entity::Task(task.clone()));

    let store = Arc::new(store);
    let reconciler = spawn_reconciler(Arc::clone(&store)).unwrap();

    let raw = fs::read_to_string(&path).unwrap();
    fs::write(
        &path,
        raw.replace("title: Watched task", "title: Watched xylophone"),
    )
    .unwrap();

    // Eventually consistent: poll until the full-text index sees the edit.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut hits = Vec::new();
    while Instant::now() < deadline {
        hits = store.run_query("xylophone").unwrap();
        if !hits.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    reconciler.stop();
    assert_eq!(hits, vec![task.id]);
}

#[test]
fn test_batch_applies_as_one_unit() -> anyhow::Result<()> {
    let (_dir, store) = open_store();

    let mut batch = store.begin();
    batch
        .create_project(NewProject {
            title: "Renovation".into(),
            ..NewProject::default()
        })
        .create_task(NewTask::new("Strip wallpaper", "renovation"))
        .create_task(NewTask::new("Paint walls", "renovation"))
        .set_status("strip-wallpaper", Status::Doing, None);
    let applied = batch.commit()?;
    assert_eq!(applied.value.len(), 4);

    assert_eq!(store.get_task("strip-wallpaper")?.status, Status::Doing);

    // A rolled-back batch leaves nothing behind.
    let mut batch = store.begin();
    batch.create_task(NewTask::new("Never happens", "renovation"));
    batch.rollback();
    assert!(store.run_query("never")?.is_empty());
    Ok(())
}

#[test]
fn test_update_patch_and_unknown_key_preservation() {
    let (_dir, store) = open_store();
    home_project(&store);
    let task = store.create_task(NewTask::new("Tune bike", "home")).unwrap().value;
    let path = store.vault().resolve_path(&Entity::Task(task.clone()));

    // A sync plugin stashes its own key in the file.
    let raw = fs::read_to_string(&path).unwrap();
    fs::write(&path, raw.replace("status: todo\n", "status: todo\nx-sync: r9\n")).unwrap();
    store
        .reconcile(&VaultChange::Upserted { path: path.clone() })
        .unwrap();

    store
        .update_task(
            task.id.as_str(),
            TaskPatch {
                tags: Some(vec!["garage".into()]),
                due: Some(NaiveDate::from_ymd_opt(2025, 9, 14)),
                ..TaskPatch::default()
            },
        )
        .unwrap();

    let rewritten = fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains("x-sync: r9"));
    assert!(rewritten.contains("tags: [garage]"));
    assert!(rewritten.contains("due: 2025-09-14"));

    let ids = store.run_query("tag:garage due<2025-10-01").unwrap();
    assert_eq!(ids, vec![task.id]);
}

#[test]
fn test_project_delete_policies() {
    let (_dir, store) = open_store();
    home_project(&store);
    store
        .create_project(NewProject {
            title: "Attic".into(),
            ..NewProject::default()
        })
        .unwrap();
    store.create_task(NewTask::new("Sort boxes", "attic")).unwrap();

    let err = store.delete_project("attic", ProjectCascade::Refuse).unwrap_err();
    assert!(matches!(err, CoreError::HasChildren { .. }));

    // Migration moves the task, then removes the project.
    store
        .delete_project("attic", ProjectCascade::MigrateTo("home".into()))
        .unwrap();
    let moved = store.get_task("sort-boxes").unwrap();
    let home = store.get_project("home").unwrap();
    assert_eq!(moved.project, home.id);
    assert!(matches!(
        store.get_project("attic"),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn test_quick_edit_operations() {
    let (_dir, store) = open_store();
    home_project(&store);
    let task = store.create_task(NewTask::new("Draft notes", "home")).unwrap().value;

    // Status cycling walks todo -> doing -> done and back.
    assert_eq!(
        store.cycle_status(task.id.as_str(), 1).unwrap().value.status,
        Status::Doing
    );
    assert_eq!(
        store.cycle_status(task.id.as_str(), -1).unwrap().value.status,
        Status::Todo
    );

    store
        .set_due(task.id.as_str(), NaiveDate::from_ymd_opt(2025, 11, 1))
        .unwrap();
    store
        .set_tags(task.id.as_str(), vec!["writing".into(), "deep-work".into()])
        .unwrap();

    // Retitling re-derives the slug and moves the file.
    let old_path = store.vault().resolve_path(&Entity::Task(
        store.get_task(task.id.as_str()).unwrap(),
    ));
    let renamed = store
        .rename_title(task.id.as_str(), "Draft the planning notes")
        .unwrap()
        .value;
    assert_eq!(renamed.slug, "draft-the-planning-notes");
    assert!(!old_path.exists());
    assert!(store
        .vault()
        .resolve_path(&Entity::Task(renamed))
        .exists());

    let ids = store.run_query("tag:writing due>2025-10-01").unwrap();
    assert_eq!(ids, vec![task.id]);
}

#[test]
fn test_audit_trail_records_mutations() {
    let (_dir, store) = open_store();
    home_project(&store);
    let task = store.create_task(NewTask::new("Logged", "home")).unwrap().value;
    store
        .set_status(task.id.as_str(), Status::Doing, None)
        .unwrap();

    let events = store.events().read_all().unwrap();
    // Project create, task create, status change.
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].id, task.id);
}
