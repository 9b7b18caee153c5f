// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Full-stack test: supervisor, partition workers, decision listener,
//! observer plane, graceful shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use veriflow_core::bus::{EventBus, Topic};
use veriflow_core::model::{NotificationKind, ReviewDecision, WorkflowStatus, workflow_id_for};
use veriflow_engine::Supervisor;
use veriflow_engine::observer::{ObserverFrame, Room};
use veriflow_stages::StageSet;

use common::{CALM_TEXT, HIGH_RISK_TEXT, TestContext, raw_item};

#[tokio::test]
async fn supervisor_processes_published_items_end_to_end() {
    let ctx = TestContext::new();
    let handle = Supervisor::start(
        ctx.cfg.clone(),
        ctx.store.clone(),
        ctx.bus.clone(),
        Arc::new(StageSet::builtin(vec!["hi".into()])),
    )
    .await
    .expect("supervisor starts");

    // subscribe before anything happens
    let mut observer = handle.observers().connect(vec![Room::Global]);
    assert!(matches!(
        observer.next().await,
        Some(ObserverFrame::Connected { .. })
    ));

    let item = raw_item("sup-low", CALM_TEXT);
    ctx.bus
        .publish(
            Topic::RawItems,
            &item.source_id,
            &serde_json::to_vec(&item).expect("encodes"),
        )
        .await
        .expect("publish works");

    let wf = ctx.await_status("sup-low", WorkflowStatus::Completed).await;

    // the observer saw the completion
    let mut saw_completed = false;
    for _ in 0..20 {
        observer.heartbeat();
        match tokio::time::timeout(Duration::from_millis(250), observer.next()).await {
            Ok(Some(ObserverFrame::Event(event))) => {
                if event.kind == NotificationKind::Completed
                    && event.workflow_id == Some(wf.workflow_id)
                {
                    saw_completed = true;
                    break;
                }
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_completed, "observer missed the completion event");

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn decision_listener_resumes_approved_workflows() {
    let ctx = TestContext::new();
    let handle = Supervisor::start(
        ctx.cfg.clone(),
        ctx.store.clone(),
        ctx.bus.clone(),
        Arc::new(StageSet::builtin(vec!["hi".into()])),
    )
    .await
    .expect("supervisor starts");

    let item = raw_item("sup-high", HIGH_RISK_TEXT);
    ctx.bus
        .publish(
            Topic::RawItems,
            &item.source_id,
            &serde_json::to_vec(&item).expect("encodes"),
        )
        .await
        .expect("publish works");

    let wf = ctx
        .await_status("sup-high", WorkflowStatus::AwaitingReview)
        .await;

    let lease = handle
        .coordinator()
        .claim(&wf.workflow_id, "sup-analyst")
        .await
        .expect("claim works");
    handle
        .coordinator()
        .decide(&wf.workflow_id, &lease.token, ReviewDecision::Approve, None)
        .await
        .expect("decide works");

    // no polling on our side: the decision event drives the resumption
    let wf = ctx
        .await_status("sup-high", WorkflowStatus::Completed)
        .await;
    assert!(wf.results.contains_key("publish"));

    handle.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn startup_recovery_reassigns_orphans() {
    let ctx = TestContext::new();

    // an in-flight workflow left behind by a dead process: no owner lease
    let item = raw_item("sup-orphan", CALM_TEXT);
    let wf = veriflow_core::model::Workflow::new(
        item,
        chrono::Utc::now() + chrono::TimeDelta::minutes(30),
    );
    let mut wf = ctx.store.create(&wf).await.expect("create works");
    wf.status = WorkflowStatus::Running;
    ctx.store.update(&wf).await.expect("update works");

    let handle = Supervisor::start(
        ctx.cfg.clone(),
        ctx.store.clone(),
        ctx.bus.clone(),
        Arc::new(StageSet::builtin(vec!["hi".into()])),
    )
    .await
    .expect("supervisor starts");

    let recovered = ctx
        .await_status("sup-orphan", WorkflowStatus::Completed)
        .await;
    assert_eq!(recovered.workflow_id, workflow_id_for("sup-orphan"));

    handle.shutdown().await.expect("clean shutdown");
}
