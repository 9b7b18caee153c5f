// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor: process lifecycle around the orchestrator.
//!
//! Binds one partition worker per `raw-items` partition, runs the startup
//! recovery pass over owner-less in-flight workflows, listens for review
//! decisions, and drains in-flight work within the grace window on
//! shutdown, releasing owner leases so another process can pick up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use veriflow_core::bus::{
    BusConsumer, Delivery, EventBus, LastError, NackOutcome, Topic,
};
use veriflow_core::config::Config;
use veriflow_core::error::BusError;
use veriflow_core::model::{NotificationEvent, NotificationKind};
use veriflow_core::store::WorkflowStore;
use veriflow_stages::StageSet;

use crate::error::EngineError;
use crate::observer::ObserverHub;
use crate::orchestrator::{Disposition, Orchestrator};
use crate::review::ReviewCoordinator;

/// Consumer group owning the `raw-items` topic.
const CONSUMER_GROUP: &str = "veriflow-orchestrator";

const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Builds and runs the engine's worker set.
pub struct Supervisor;

impl Supervisor {
    /// Start partition workers, the recovery pass, the decision listener,
    /// the reminder worker and the observer hub.
    ///
    /// Fails fast on bus authentication errors; everything else is retried
    /// inside the workers.
    pub async fn start(
        cfg: Arc<Config>,
        store: WorkflowStore,
        bus: Arc<dyn EventBus>,
        stages: Arc<StageSet>,
    ) -> Result<SupervisorHandle, EngineError> {
        let owner = format!(
            "veriflow-{}-{}",
            std::process::id(),
            &Uuid::new_v4().to_string()[..8]
        );
        info!(%owner, "supervisor starting");

        let orchestrator = Arc::new(Orchestrator::new(
            cfg.clone(),
            store.clone(),
            bus.clone(),
            stages,
            owner.clone(),
        ));
        let coordinator = Arc::new(ReviewCoordinator::new(
            cfg.clone(),
            store.clone(),
            bus.clone(),
        ));
        let observers = ObserverHub::new(&cfg);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let aux_shutdown = Arc::new(Notify::new());
        let mut workers = JoinSet::new();

        // recovery pass before accepting new work
        let recovered = recover_orphans(&orchestrator, &store, &owner).await?;
        if recovered > 0 {
            info!(recovered, "recovery pass reassigned orphaned workflows");
        }

        // one worker per assigned partition
        for partition in 0..bus.partitions(Topic::RawItems) {
            let consumer = match bus.consumer(Topic::RawItems, CONSUMER_GROUP, partition).await {
                Ok(consumer) => consumer,
                Err(e @ BusError::Auth(_)) => {
                    error!(error = %e, "bus rejected credentials");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };
            workers.spawn(partition_worker(
                consumer,
                orchestrator.clone(),
                shutdown_rx.clone(),
                partition,
            ));
        }

        // resume workflows when review decisions land
        workers.spawn(decision_listener(
            store.clone(),
            orchestrator.clone(),
            shutdown_rx.clone(),
        ));

        // overdue review reminders
        workers.spawn(coordinator.clone().run_reminders(aux_shutdown.clone()));

        // observer fan-out
        let _hub_task = observers.start(&store, aux_shutdown.clone()).await?;

        Ok(SupervisorHandle {
            cfg,
            store,
            owner,
            orchestrator,
            coordinator,
            observers,
            shutdown_tx,
            aux_shutdown,
            workers,
        })
    }
}

/// A running engine. Dropping it abandons the workers; call
/// [`shutdown`](Self::shutdown) for a graceful drain.
pub struct SupervisorHandle {
    cfg: Arc<Config>,
    store: WorkflowStore,
    owner: String,
    orchestrator: Arc<Orchestrator>,
    coordinator: Arc<ReviewCoordinator>,
    observers: Arc<ObserverHub>,
    shutdown_tx: watch::Sender<bool>,
    aux_shutdown: Arc<Notify>,
    workers: JoinSet<()>,
}

impl SupervisorHandle {
    /// The orchestrator driving this process's workflows.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// The operator surface.
    pub fn coordinator(&self) -> &Arc<ReviewCoordinator> {
        &self.coordinator
    }

    /// The observer plane hub.
    pub fn observers(&self) -> &Arc<ObserverHub> {
        &self.observers
    }

    /// Stop intake, drain in-flight work up to the grace deadline, then
    /// release owner leases so another process may pick up.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        info!("supervisor shutting down");
        let _ = self.shutdown_tx.send(true);
        self.aux_shutdown.notify_waiters();

        let drained = tokio::time::timeout(self.cfg.shutdown_grace, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = self.cfg.shutdown_grace.as_secs(),
                "grace window expired, aborting remaining workers"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        for wf in self.store.list_inflight().await? {
            if self.store.owner_of(&wf.workflow_id).await? == Some(self.owner.clone()) {
                self.store.release_owner(&wf.workflow_id).await?;
            }
        }
        info!("supervisor stopped");
        Ok(())
    }
}

/// Scan for in-flight workflows without a live owner and resume them.
async fn recover_orphans(
    orchestrator: &Arc<Orchestrator>,
    store: &WorkflowStore,
    owner: &str,
) -> Result<usize, EngineError> {
    let mut recovered = 0;
    for wf in store.list_inflight().await? {
        match store.owner_of(&wf.workflow_id).await? {
            Some(other) if other != owner => continue,
            _ => {}
        }
        info!(workflow_id = %wf.workflow_id, status = %wf.status, "recovering orphaned workflow");
        match orchestrator.resume(&wf.workflow_id).await {
            Ok(_) => recovered += 1,
            Err(e) => warn!(workflow_id = %wf.workflow_id, error = %e, "recovery failed"),
        }
    }
    Ok(recovered)
}

async fn partition_worker(
    mut consumer: Box<dyn BusConsumer>,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
    partition: u32,
) {
    info!(partition, "partition worker started");
    let mut backoff = BACKOFF_BASE;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let polled = tokio::select! {
            _ = shutdown.changed() => continue,
            polled = consumer.poll(POLL_TIMEOUT) => polled,
        };
        let delivery = match polled {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e @ BusError::Auth(_)) => {
                error!(partition, error = %e, "bus rejected credentials, worker exiting");
                break;
            }
            Err(e) => {
                warn!(partition, error = %e, "poll failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };
        backoff = BACKOFF_BASE;

        handle_one(&mut consumer, &orchestrator, &delivery).await;
    }
    info!(partition, "partition worker stopped");
}

async fn handle_one(
    consumer: &mut Box<dyn BusConsumer>,
    orchestrator: &Arc<Orchestrator>,
    delivery: &Delivery,
) {
    match orchestrator.handle_delivery(delivery).await {
        Ok(Disposition::Processed | Disposition::Parked | Disposition::Duplicate(_)) => {
            // state is durably checkpointed; only now move the offset
            if let Err(e) = consumer.commit(delivery).await {
                warn!(error = %e, "offset commit failed");
            }
        }
        Ok(Disposition::DeadLetter(last_error)) => {
            if let Err(e) = consumer.dead_letter(delivery, &last_error).await {
                warn!(error = %e, "dead-letter routing failed");
            }
            if let Err(e) = orchestrator
                .fail_dead_lettered(&delivery.payload, &last_error)
                .await
            {
                warn!(error = %e, "dead-letter workflow failure not recorded");
            }
        }
        Err(engine_err) => {
            let last_error = LastError {
                kind: engine_err.kind(),
                detail: engine_err.to_string(),
            };
            warn!(
                offset = delivery.offset,
                attempts = delivery.attempts,
                error = %engine_err,
                "delivery processing failed"
            );
            match consumer.nack(delivery, &last_error).await {
                Ok(NackOutcome::Redeliver) => {
                    tokio::time::sleep(BACKOFF_BASE).await;
                }
                Ok(NackOutcome::DeadLettered) => {
                    if let Err(e) = orchestrator
                        .fail_dead_lettered(&delivery.payload, &last_error)
                        .await
                    {
                        warn!(error = %e, "dead-letter workflow failure not recorded");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "nack failed");
                    tokio::time::sleep(BACKOFF_BASE).await;
                }
            }
        }
    }
}

/// Resume workflows whose review decision just landed.
async fn decision_listener(
    store: WorkflowStore,
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut feed = match store.subscribe_events().await {
        Ok(feed) => feed,
        Err(e) => {
            error!(error = %e, "decision listener could not subscribe");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            received = feed.recv() => match received {
                Ok(blob) => {
                    let Ok(event) = serde_json::from_slice::<NotificationEvent>(&blob) else {
                        continue;
                    };
                    if event.kind != NotificationKind::ReviewDecided {
                        continue;
                    }
                    let Some(workflow_id) = event.workflow_id else { continue };
                    if let Err(e) = orchestrator.resume(&workflow_id).await {
                        warn!(%workflow_id, error = %e, "post-decision resume failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "decision listener lagged; sweeping for resumable workflows");
                    // fall back to a scan so no decision is lost
                    if let Ok(inflight) = store.list_inflight().await {
                        for wf in inflight {
                            let _ = orchestrator.resume(&wf.workflow_id).await;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    info!("decision listener stopped");
}
