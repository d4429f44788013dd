use std::time::Duration;

use chrono::Utc;
use serial_test::serial;
use uuid::Uuid;

use crate::tests::{TestContext, fixtures::*};
use crate::workflows::interpreter::NewLogEntry;
use crate::workflows::model::{ExecutionStatus, LogStatus};
use crate::workflows::{EnrollmentManager, WorkflowStore};

#[tokio::test]
#[serial]
#[ignore]
async fn test_cancellation_discards_an_in_flight_tick_result() {
    let ctx = TestContext::new().await;
    let store = WorkflowStore::new(ctx.db_pool.clone());
    let enrollments = EnrollmentManager::new(ctx.db_pool.clone());

    let workflow = insert_active_workflow(&store, false).await;
    enrollments
        .enroll(workflow.id, "camper", Uuid::new_v4(), serde_json::Map::new())
        .await
        .unwrap()
        .unwrap();

    let mut claimed = store
        .claim_due("worker-1", 10, Duration::from_secs(60), Utc::now())
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    let mut execution = claimed.remove(0);

    assert!(store.cancel_execution(execution.id).await.unwrap());

    // The worker finishes its tick after the cancel landed.
    execution.current_step_id = Some("welcome".to_string());
    execution.next_step_at = Some(Utc::now() + chrono::Duration::hours(1));
    assert!(!store.persist_step_result(&execution).await.unwrap());

    let stored = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.next_step_at, None);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_logs_read_back_in_emitted_order() {
    let ctx = TestContext::new().await;
    let store = WorkflowStore::new(ctx.db_pool.clone());
    let enrollments = EnrollmentManager::new(ctx.db_pool.clone());

    let workflow = insert_active_workflow(&store, false).await;
    let execution_id = enrollments
        .enroll(workflow.id, "camper", Uuid::new_v4(), serde_json::Map::new())
        .await
        .unwrap()
        .unwrap();

    // One tick can drain several steps; every entry shares its timestamp.
    let ticked_at = Utc::now();
    let entries: Vec<NewLogEntry> = ["welcome", "tag_family", "confirm"]
        .iter()
        .map(|step_id| NewLogEntry {
            step_id: step_id.to_string(),
            step_type: "send_email",
            status: LogStatus::Success,
            input: serde_json::json!({}),
            output: serde_json::json!({}),
            error_message: None,
            executed_at: ticked_at,
            duration_ms: 0,
        })
        .collect();
    store.append_logs(execution_id, &entries).await.unwrap();

    let logs = store.fetch_logs(execution_id).await.unwrap();
    let step_ids: Vec<&str> = logs.iter().map(|log| log.step_id.as_str()).collect();
    assert_eq!(step_ids, ["welcome", "tag_family", "confirm"]);
    assert!(logs.windows(2).all(|pair| pair[0].seq < pair[1].seq));

    ctx.cleanup().await;
}
