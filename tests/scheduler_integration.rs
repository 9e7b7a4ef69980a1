//! End-to-end scheduler tests against a file-backed database and a real shell.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;

use cron_scheduler::config::SchedulerConfig;
use cron_scheduler::runner::ShellRunner;
use cron_scheduler::scheduler::SchedulerEngine;
use cron_scheduler::store::{ExecutionStore, LibSqlBackend, TaskStore};
use cron_scheduler::tasks::{ExecutionStatus, NewTask, TaskStatus};

fn test_config(dir: &tempfile::TempDir) -> SchedulerConfig {
    SchedulerConfig {
        db_path: dir.path().join("scheduler.db"),
        poll_interval: Duration::from_secs(1),
        max_concurrent_runs: 2,
        ..SchedulerConfig::default()
    }
}

async fn engine_for(config: &SchedulerConfig) -> (Arc<SchedulerEngine>, Arc<LibSqlBackend>) {
    let store = Arc::new(LibSqlBackend::new_local(&config.db_path).await.unwrap());
    let runner = Arc::new(ShellRunner::from_config(config));
    let engine = Arc::new(SchedulerEngine::new(config.clone(), store.clone(), runner));
    (engine, store)
}

#[tokio::test]
async fn shell_command_output_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = engine_for(&test_config(&dir)).await;
    let task = store
        .create_task(&NewTask::new("greet", "* * * * *", "echo hello; echo warn >&2"))
        .await
        .unwrap();

    let summary = engine
        .tick_at(task.created_at + ChronoDuration::minutes(2))
        .await
        .unwrap();
    assert_eq!(summary.claimed, 1);
    summary.join_workers().await;

    let t = store.get_task(task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Active);

    let runs = store.list_executions_for_task(task.id, 5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, ExecutionStatus::Success);
    assert_eq!(runs[0].stdout.as_deref(), Some("hello\n"));
    assert_eq!(runs[0].stderr.as_deref(), Some("warn\n"));
}

#[tokio::test]
async fn failing_command_retries_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = engine_for(&test_config(&dir)).await;
    let task = store
        .create_task(&NewTask::new("flaky", "* * * * *", "exit 7").with_max_retries(1))
        .await
        .unwrap();

    let first = task.created_at + ChronoDuration::minutes(2);
    engine.tick_at(first).await.unwrap().join_workers().await;
    let t = store.get_task(task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Pending);
    assert_eq!(t.retry_count, 1);

    let second = first + ChronoDuration::minutes(2);
    engine.tick_at(second).await.unwrap().join_workers().await;
    let t = store.get_task(task.id).await.unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert_eq!(t.retry_count, 1);
    assert_eq!(t.last_error.as_deref(), Some("command exited with status 7"));

    let runs = store.list_executions_for_task(task.id, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == ExecutionStatus::Failed));
}

#[tokio::test]
async fn two_schedulers_on_one_database_run_a_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let (first, store) = engine_for(&config).await;
    let (second, _) = engine_for(&config).await;

    let task = store
        .create_task(&NewTask::new("once", "* * * * *", "sleep 0.2"))
        .await
        .unwrap();
    let now = task.created_at + ChronoDuration::minutes(2);

    let a = first.tick_at(now).await.unwrap();
    let b = second.tick_at(now).await.unwrap();
    assert_eq!(a.claimed + b.claimed, 1);

    a.join_workers().await;
    b.join_workers().await;
    assert_eq!(store.list_executions_for_task(task.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn tasks_survive_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let id = {
        let store = LibSqlBackend::new_local(&config.db_path).await.unwrap();
        let task = store
            .create_task(&NewTask::new("nightly", "0 3 * * *", "true"))
            .await
            .unwrap();
        store.set_paused(task.id, true).await.unwrap();
        task.id
    };

    let store = LibSqlBackend::new_local(&config.db_path).await.unwrap();
    let t = store.get_task(id).await.unwrap();
    assert_eq!(t.name, "nightly");
    assert_eq!(t.status, TaskStatus::Paused);
}

#[tokio::test]
async fn run_loop_executes_forced_task_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = engine_for(&test_config(&dir)).await;
    let task = store
        .create_task(&NewTask::new("adhoc", "0 0 1 1 *", "echo forced"))
        .await
        .unwrap();
    store
        .request_force_run(task.id, chrono::Utc::now())
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&engine).run(rx));

    let mut status = TaskStatus::Pending;
    for _ in 0..50 {
        status = store.get_task(task.id).await.unwrap().status;
        if status == TaskStatus::Active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(status, TaskStatus::Active);

    tx.send(true).unwrap();
    handle.await.unwrap();
    assert!(engine.drain(Duration::from_secs(5)).await);

    let t = store.get_task(task.id).await.unwrap();
    assert!(t.force_run_at.is_none());
    let runs = store.list_executions_for_task(task.id, 5).await.unwrap();
    assert_eq!(runs[0].stdout.as_deref(), Some("forced\n"));
}
