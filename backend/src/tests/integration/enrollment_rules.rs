use std::sync::Arc;

use serial_test::serial;
use uuid::Uuid;

use crate::tests::{TestContext, fixtures::*, helpers::count_table_rows};
use crate::workflows::model::ExecutionStatus;
use crate::workflows::{EnrollmentManager, WorkflowStore};

fn seed() -> serde_json::Map<String, serde_json::Value> {
    serde_json::Map::new()
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_second_enrollment_is_skipped_without_re_enrollment() {
    let ctx = TestContext::new().await;
    let store = WorkflowStore::new(ctx.db_pool.clone());
    let enrollments = EnrollmentManager::new(ctx.db_pool.clone());

    let workflow = insert_active_workflow(&store, false).await;
    let camper = Uuid::new_v4();

    let first = enrollments
        .enroll(workflow.id, "camper", camper, seed())
        .await
        .unwrap();
    assert!(first.is_some());

    let second = enrollments
        .enroll(workflow.id, "camper", camper, seed())
        .await
        .unwrap();
    assert_eq!(second, None);

    assert_eq!(count_table_rows(&ctx.db_pool, "workflow_executions").await, 1);
    let workflow = store.get_workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.total_enrolled, 1);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_re_enrollment_cancels_the_prior_execution() {
    let ctx = TestContext::new().await;
    let store = WorkflowStore::new(ctx.db_pool.clone());
    let enrollments = EnrollmentManager::new(ctx.db_pool.clone());

    let workflow = insert_active_workflow(&store, true).await;
    let camper = Uuid::new_v4();

    let first = enrollments
        .enroll(workflow.id, "camper", camper, seed())
        .await
        .unwrap()
        .unwrap();
    let second = enrollments
        .enroll(workflow.id, "camper", camper, seed())
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first, second);

    let prior = store.get_execution(first).await.unwrap().unwrap();
    assert_eq!(prior.status, ExecutionStatus::Cancelled);
    assert!(prior.completed_at.is_some());

    let replacement = store.get_execution(second).await.unwrap().unwrap();
    assert_eq!(replacement.status, ExecutionStatus::Running);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_enrollment_into_inactive_workflow_is_a_no_op() {
    let ctx = TestContext::new().await;
    let store = WorkflowStore::new(ctx.db_pool.clone());
    let enrollments = EnrollmentManager::new(ctx.db_pool.clone());

    let draft = store
        .create_workflow(Uuid::new_v4(), registration_draft(false))
        .await
        .unwrap();

    let outcome = enrollments
        .enroll(draft.id, "camper", Uuid::new_v4(), seed())
        .await
        .unwrap();
    assert_eq!(outcome, None);
    assert_eq!(count_table_rows(&ctx.db_pool, "workflow_executions").await, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_concurrent_enrollments_all_count() {
    let ctx = TestContext::new().await;
    let store = WorkflowStore::new(ctx.db_pool.clone());
    let enrollments = Arc::new(EnrollmentManager::new(ctx.db_pool.clone()));

    let workflow = insert_active_workflow(&store, false).await;
    let entities = 8;

    let mut handles = Vec::new();
    for _ in 0..entities {
        let enrollments = enrollments.clone();
        let workflow_id = workflow.id;
        handles.push(tokio::spawn(async move {
            enrollments
                .enroll(workflow_id, "camper", Uuid::new_v4(), seed())
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_some());
    }

    let workflow = store.get_workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.total_enrolled, entities);
    assert_eq!(
        count_table_rows(&ctx.db_pool, "workflow_executions").await,
        entities
    );

    ctx.cleanup().await;
}
