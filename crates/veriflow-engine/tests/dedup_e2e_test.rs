// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exactly-one-workflow-per-item guarantees.

mod common;

use veriflow_core::bus::{NotificationMessage, Topic};
use veriflow_core::model::{WorkflowStatus, workflow_id_for};
use veriflow_engine::orchestrator::Disposition;

use common::{CALM_TEXT, HIGH_RISK_TEXT, TestContext, raw_item};

#[tokio::test]
async fn duplicate_delivery_is_acknowledged_without_side_effects() {
    let ctx = TestContext::new();
    let item = raw_item("c", CALM_TEXT);

    let first = ctx.deliver(&item).await;
    assert!(matches!(first, Disposition::Processed));

    let second = ctx.deliver(&item).await;
    match second {
        Disposition::Duplicate(id) => assert_eq!(id, workflow_id_for("c")),
        other => panic!("unexpected disposition: {other:?}"),
    }

    // exactly one workflow, exactly one publication
    let wf = ctx.workflow("c").await;
    assert_eq!(wf.workflow_id, workflow_id_for("c"));
    assert_eq!(wf.status, WorkflowStatus::Completed);

    let notifications: Vec<NotificationMessage> = ctx.drain(Topic::Notifications).await;
    assert_eq!(notifications.len(), 1);
}

#[tokio::test]
async fn duplicate_of_a_parked_workflow_is_acknowledged() {
    let ctx = TestContext::new();
    let item = raw_item("parked-dup", HIGH_RISK_TEXT);

    assert!(matches!(ctx.deliver(&item).await, Disposition::Parked));
    assert!(matches!(
        ctx.deliver(&item).await,
        Disposition::Duplicate(_)
    ));
    assert_eq!(
        ctx.workflow("parked-dup").await.status,
        WorkflowStatus::AwaitingReview
    );
}

#[tokio::test]
async fn redelivery_yields_the_same_final_state() {
    let ctx = TestContext::new();
    let item = raw_item("idem", CALM_TEXT);

    ctx.deliver(&item).await;
    let first = ctx.workflow("idem").await;

    ctx.deliver(&item).await;
    let second = ctx.workflow("idem").await;

    assert_eq!(first.workflow_id, second.workflow_id);
    assert_eq!(first.status, second.status);
    assert_eq!(first.results, second.results);
    assert_eq!(first.risk_score, second.risk_score);
    assert_eq!(first.version, second.version);
}

#[tokio::test]
async fn distinct_source_ids_get_distinct_workflows() {
    let ctx = TestContext::new();
    ctx.deliver(&raw_item("d1", CALM_TEXT)).await;
    ctx.deliver(&raw_item("d2", CALM_TEXT)).await;

    assert_ne!(
        ctx.workflow("d1").await.workflow_id,
        ctx.workflow("d2").await.workflow_id
    );
}
