//! Recovery manager tests: pause/resume, checkpoints, rollback, shutdown.

use std::sync::Arc;

use fleetgate::fleetgate::recovery::{PauseReason, RecoveryManager};
use fleetgate::fleetgate::tasks::{Subtask, Task, TaskStatus, TaskStore};

async fn store_with_task(task_id: &str) -> (Arc<TaskStore>, String) {
    let store = Arc::new(TaskStore::new());
    let mut task = Task::new(task_id, "a task");
    let mut subtask = Subtask::new(task_id, "working");
    subtask.status = TaskStatus::InProgress;
    subtask.assigned_to = Some("w1".to_string());
    let subtask_id = subtask.subtask_id.clone();
    task.add_subtask(subtask).unwrap();
    task.status = TaskStatus::InProgress;
    store.save(task).await;
    (store, subtask_id)
}

#[tokio::test]
async fn test_pause_resume_idempotent_affected_set() {
    let (store, subtask_id) = store_with_task("T1").await;
    let dir = tempfile::tempdir().unwrap();
    let manager = RecoveryManager::new(Arc::clone(&store), dir.path()).unwrap();

    // L2: pause; resume; pause leaves the same affected set when subtask
    // states are unchanged in between.
    manager
        .pause_task("T1", PauseReason::UserRequest, "", "tester")
        .await
        .unwrap();
    let first = manager.pause_state("T1").await.unwrap().affected_subtasks;
    assert_eq!(first, vec![subtask_id.clone()]);

    manager.resume_task("T1", "tester").await.unwrap();
    assert!(!manager.is_task_paused("T1").await);

    manager
        .pause_task("T1", PauseReason::UserRequest, "", "tester")
        .await
        .unwrap();
    let second = manager.pause_state("T1").await.unwrap().affected_subtasks;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_pause_refuses_terminal_and_double_pause() {
    let (store, _) = store_with_task("T1").await;
    let dir = tempfile::tempdir().unwrap();
    let manager = RecoveryManager::new(Arc::clone(&store), dir.path()).unwrap();

    manager
        .pause_task("T1", PauseReason::UserRequest, "", "tester")
        .await
        .unwrap();
    assert!(manager
        .pause_task("T1", PauseReason::UserRequest, "", "tester")
        .await
        .is_err());

    let mut done = Task::new("T2", "done");
    done.status = TaskStatus::Completed;
    store.save(done).await;
    assert!(manager
        .pause_task("T2", PauseReason::UserRequest, "", "tester")
        .await
        .is_err());
}

#[tokio::test]
async fn test_checkpoint_restore_round_trip() {
    let (store, subtask_id) = store_with_task("T1").await;
    let dir = tempfile::tempdir().unwrap();
    let manager = RecoveryManager::new(Arc::clone(&store), dir.path()).unwrap();

    let original = store.get("T1").await.unwrap();
    let checkpoint_id = manager
        .create_checkpoint("T1", "before risky change", "tester", false)
        .await
        .unwrap();

    // Mutate the live task.
    store
        .with_task("T1", |task| {
            let st = task.subtask_mut(&subtask_id).unwrap();
            st.status = TaskStatus::Failed;
            st.current_iteration = 99;
            task.total_iterations_used = 99;
        })
        .await
        .unwrap();

    manager
        .restore_checkpoint("T1", &checkpoint_id, false)
        .await
        .unwrap();

    // L3: observable state round-trips.
    let restored = store.get("T1").await.unwrap();
    assert_eq!(restored.task_id, original.task_id);
    assert_eq!(restored.status, original.status);
    assert_eq!(restored.total_iterations_used, original.total_iterations_used);
    assert_eq!(restored.created_at, original.created_at);
    assert_eq!(restored.subtasks.len(), original.subtasks.len());
    let restored_st = restored.subtask(&subtask_id).unwrap();
    let original_st = original.subtask(&subtask_id).unwrap();
    assert_eq!(restored_st.status, original_st.status);
    assert_eq!(restored_st.current_iteration, original_st.current_iteration);
    assert_eq!(restored_st.created_at, original_st.created_at);
}

#[tokio::test]
async fn test_checkpoint_cap_evicts_oldest() {
    let (store, _) = store_with_task("T1").await;
    let dir = tempfile::tempdir().unwrap();
    let manager = RecoveryManager::new(Arc::clone(&store), dir.path()).unwrap();

    let mut ids = Vec::new();
    for i in 0..7 {
        // Distinct timestamps so eviction order is well-defined.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ids.push(
            manager
                .create_checkpoint("T1", &format!("cp {}", i), "tester", false)
                .await
                .unwrap(),
        );
    }

    let remaining = manager.list_checkpoints("T1");
    assert_eq!(remaining.len(), RecoveryManager::MAX_CHECKPOINTS_PER_TASK);
    // The oldest two were deleted.
    let remaining_ids: Vec<&str> = remaining
        .iter()
        .map(|c| c.checkpoint_id.as_str())
        .collect();
    assert!(!remaining_ids.contains(&ids[0].as_str()));
    assert!(!remaining_ids.contains(&ids[1].as_str()));
    assert!(remaining_ids.contains(&ids[6].as_str()));
}

#[tokio::test]
async fn test_rollback_refuses_completed() {
    let (store, subtask_id) = store_with_task("T1").await;
    let dir = tempfile::tempdir().unwrap();
    let manager = RecoveryManager::new(Arc::clone(&store), dir.path()).unwrap();

    // In-progress subtask rolls back to pending.
    let message = manager
        .rollback_subtask("T1", &subtask_id, "stuck worker")
        .await
        .unwrap();
    assert!(message.contains("rolled back"));
    let task = store.get("T1").await.unwrap();
    let st = task.subtask(&subtask_id).unwrap();
    assert_eq!(st.status, TaskStatus::Pending);
    assert!(st.assigned_to.is_none());
    assert!(task.metadata.contains_key("rollbacks"));

    // I6: completed subtasks cannot be rolled back.
    store
        .with_task("T1", |task| {
            task.subtask_mut(&subtask_id).unwrap().status = TaskStatus::Completed;
        })
        .await
        .unwrap();
    assert!(manager
        .rollback_subtask("T1", &subtask_id, "nope")
        .await
        .is_err());
}

#[tokio::test]
async fn test_retry_accounting() {
    let (store, _) = store_with_task("T1").await;
    let dir = tempfile::tempdir().unwrap();
    let manager = RecoveryManager::new(store, dir.path()).unwrap();

    assert!(manager.should_retry("st_x").await);
    for _ in 0..RecoveryManager::MAX_RETRY_ATTEMPTS {
        manager.record_retry("st_x").await;
    }
    assert!(!manager.should_retry("st_x").await);
    manager.reset_retry_count("st_x").await;
    assert_eq!(manager.retry_count("st_x").await, 0);
}

#[tokio::test]
async fn test_graceful_shutdown_and_startup_recovery() {
    let (store, _) = store_with_task("T1").await;
    {
        let mut task = Task::new("T2", "second");
        task.status = TaskStatus::InProgress;
        let mut st = Subtask::new("T2", "s");
        st.status = TaskStatus::InProgress;
        task.add_subtask(st).unwrap();
        store.save(task).await;
    }
    let dir = tempfile::tempdir().unwrap();

    let summary = {
        let manager = RecoveryManager::new(Arc::clone(&store), dir.path()).unwrap();
        manager.prepare_shutdown().await
    };
    assert_eq!(summary["paused_tasks"], 2);
    // Pausing leaves the task status non-terminal, so both still checkpoint.
    assert_eq!(summary["checkpoints_created"], 2);
    assert!(dir.path().join("pause_states.json").exists());

    // A fresh manager on the same directory sees the persisted pauses and
    // auto-resumes the maintenance ones.
    let manager = RecoveryManager::new(Arc::clone(&store), dir.path()).unwrap();
    assert!(manager.is_task_paused("T1").await);
    let summary = manager.recover_from_shutdown().await;
    assert_eq!(summary["paused_tasks_found"], 2);
    assert_eq!(summary["auto_resumed"], 2);
    assert!(!manager.is_task_paused("T1").await);
}
