mod support;

use std::sync::Arc;
use std::thread;

use stagegate::actor::Capabilities;
use stagegate::config::Config;
use stagegate::events::MemorySink;
use stagegate::model::{Assignees, ProjectStatus, StageStatus, TaskStatus};
use stagegate::store::{FileStore, Store};
use stagegate::workflow::{NewProject, NewStage, NewTask, TransitionRequest, Workflow};

use support::{manager, member};

fn open(dir: &std::path::Path) -> Workflow<FileStore> {
    let config = Config::default();
    Workflow::from_config(FileStore::open(dir, &config), &config)
}

fn seed(workflow: &Workflow<FileStore>, tasks: usize) -> Vec<String> {
    let mut stage = NewStage::new("Build");
    stage.tasks = (0..tasks)
        .map(|idx| {
            NewTask::new(
                format!("Task {idx}"),
                Assignees::single("u-1").expect("assignees"),
            )
        })
        .collect();
    let report = workflow
        .create_project(
            &manager(),
            NewProject {
                name: "Parallel".to_string(),
                stages: vec![stage],
                ..NewProject::default()
            },
        )
        .expect("create")
        .into_result()
        .expect("created");
    report.tasks.into_iter().map(|task| task.id).collect()
}

#[test]
fn board_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStore::open(dir.path(), &Config::default());
    store.init().expect("init");

    let task_ids = seed(&open(dir.path()), 2);
    let reopened = open(dir.path());
    let board = reopened.load_board().expect("load");
    assert_eq!(board.projects.len(), 1);
    assert_eq!(board.tasks.len(), 2);
    assert!(task_ids.iter().all(|id| board.task(id).is_some()));
}

#[test]
fn parallel_transitions_all_land() {
    let dir = tempfile::tempdir().expect("tempdir");
    FileStore::open(dir.path(), &Config::default())
        .init()
        .expect("init");
    let task_ids = seed(&open(dir.path()), 6);

    thread::scope(|scope| {
        for task_id in &task_ids {
            let root = dir.path();
            scope.spawn(move || {
                let workflow = open(root);
                let outcome = workflow
                    .transition(&member(), TransitionRequest::new(task_id, TaskStatus::InProgress))
                    .expect("transition");
                assert!(outcome.is_applied());
            });
        }
    });

    let board = open(dir.path()).load_board().expect("load");
    for task in &board.tasks {
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.status_history.len(), 2);
    }
    assert_eq!(board.projects[0].status, ProjectStatus::InProgress);
}

#[test]
fn parallel_sibling_completions_complete_the_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    FileStore::open(dir.path(), &Config::default())
        .init()
        .expect("init");
    let task_ids = seed(&open(dir.path()), 6);
    for task_id in &task_ids {
        assert!(open(dir.path())
            .transition(&member(), TransitionRequest::new(task_id, TaskStatus::InProgress))
            .expect("start")
            .is_applied());
    }

    thread::scope(|scope| {
        for task_id in &task_ids {
            let root = dir.path();
            scope.spawn(move || {
                let outcome = open(root)
                    .transition(&member(), TransitionRequest::new(task_id, TaskStatus::Completed))
                    .expect("complete");
                assert!(outcome.is_applied());
            });
        }
    });

    let board = open(dir.path()).load_board().expect("load");
    assert!(board.tasks.iter().all(|task| task.status == TaskStatus::Completed));
    assert_eq!(board.stages[0].status, StageStatus::Completed);
    assert_eq!(board.projects[0].status, ProjectStatus::Completed);
}

#[test]
fn replay_across_processes_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    FileStore::open(dir.path(), &Config::default())
        .init()
        .expect("init");
    let task_ids = seed(&open(dir.path()), 1);

    let sink = Arc::new(MemorySink::new());
    let first = open(dir.path()).with_sink(sink.clone());
    let request = TransitionRequest::new(&task_ids[0], TaskStatus::InProgress).with_op_id("op-7");
    assert!(first
        .transition(&member(), request.clone())
        .expect("first")
        .is_applied());

    // Same op id from a fresh engine, after another process already
    // moved the task on.
    let store = FileStore::open(dir.path(), &Config::default());
    let second = Workflow::new(store, Capabilities::default()).with_sink(sink.clone());
    assert!(second
        .transition(&member(), TransitionRequest::new(&task_ids[0], TaskStatus::Completed))
        .expect("complete")
        .is_applied());
    let replay = second
        .transition(&member(), request)
        .expect("replay");
    assert!(!replay.is_applied());

    let task = second.store().load().expect("load").tasks.remove(0);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.status_history.len(), 3);
    assert_eq!(sink.delivered().len(), 2);
}
