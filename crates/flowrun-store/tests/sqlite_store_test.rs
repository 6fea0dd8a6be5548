//! Optimistic concurrency of the SQLite execution store.

use flowrun_config::{Flow, Task};
use flowrun_model::{Execution, StateType};
use flowrun_store::{ExecutionStore, SqliteExecutionStore, StoreError, connect, migrate};
use tempfile::TempDir;

async fn store() -> (TempDir, SqliteExecutionStore) {
  let dir = TempDir::new().unwrap();
  let pool = connect(&dir.path().join("flowrun.db")).await.unwrap();
  migrate(&pool).await.unwrap();
  (dir, SqliteExecutionStore::new(pool))
}

fn execution() -> Execution {
  let flow = Flow::new("io.flowrun", "store", vec![Task::runnable("a", "log")]);
  Execution::new(&flow, Default::default())
}

#[tokio::test]
async fn test_save_and_find() {
  let (_dir, store) = store().await;
  let execution = execution();

  let version = store.save(&execution, None).await.unwrap();
  let stored = store.find(&execution.id).await.unwrap().unwrap();

  assert_eq!(version, 1);
  assert_eq!(stored.version, 1);
  assert_eq!(stored.execution, execution);
}

#[tokio::test]
async fn test_concurrent_update_conflicts() {
  let (_dir, store) = store().await;
  let execution = execution();
  let v1 = store.save(&execution, None).await.unwrap();

  let running = execution.with_state(StateType::Running);
  let v2 = store.save(&running, Some(v1)).await.unwrap();
  assert_eq!(v2, 2);

  match store.save(&execution, Some(v1)).await {
    Err(StoreError::Conflict {
      expected, found, ..
    }) => {
      assert_eq!(expected, Some(1));
      assert_eq!(found, Some(2));
    }
    other => panic!("expected a conflict, got {:?}", other),
  }

  assert!(matches!(
    store.save(&execution, None).await,
    Err(StoreError::Conflict { .. })
  ));
}

#[tokio::test]
async fn test_list_running_skips_terminated() {
  let (_dir, store) = store().await;
  let running = execution().with_state(StateType::Running);
  let done = execution()
    .with_state(StateType::Running)
    .with_state(StateType::Success);

  store.save(&running, None).await.unwrap();
  store.save(&done, None).await.unwrap();

  let listed = store.list_running().await.unwrap();
  assert_eq!(listed.len(), 1);
  assert_eq!(listed[0].id, running.id);
}
