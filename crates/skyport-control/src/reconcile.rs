//! Polls a node's per-volume state endpoint until an instance converges.
//!
//! Every in-flight reconciliation is persisted under `<instanceId>_reconcile` with its
//! attempt count, and listed under `reconciliations`, so a restart resumes where the
//! previous process stopped instead of leaving the instance stuck in INSTALLING.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyport_model::InternalState;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::Instrument;

use crate::{
    config::PollConfig,
    error::{ControlError, ControlResult},
    node_client::{NodeClient, NodeError},
    registry::Registry,
};

pub const RECONCILIATIONS_KEY: &str = "reconciliations";

pub fn reconcile_key(instance_id: &str) -> String {
    format!("{instance_id}_reconcile")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileTask {
    pub instance_id: String,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl ReconcileTask {
    fn fresh(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            attempts: 0,
            started_at: Utc::now(),
            last_poll_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Ready,
    Failed { reason: String },
    /// The instance was deleted while being polled.
    InstanceGone,
}

struct Inner {
    registry: Registry,
    client: NodeClient,
    config: PollConfig,
    tasks: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(registry: Registry, client: NodeClient, config: PollConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                client,
                config,
                tasks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Start (or restart from zero) reconciliation for an instance.
    pub async fn track(&self, instance_id: &str) -> ControlResult<()> {
        self.abort_running(instance_id).await;
        let task = ReconcileTask::fresh(instance_id);
        self.persist(&task).await?;
        self.inner
            .registry
            .add_id(RECONCILIATIONS_KEY, instance_id)
            .await?;
        self.spawn(instance_id).await;
        Ok(())
    }

    /// Respawn every persisted task, continuing from its stored attempt count.
    pub async fn resume(&self) -> ControlResult<usize> {
        let mut resumed = 0;
        for id in self.inner.registry.list_ids(RECONCILIATIONS_KEY).await? {
            if self.load(&id).await?.is_none() {
                self.inner.registry.remove_id(RECONCILIATIONS_KEY, &id).await?;
                continue;
            }
            self.spawn(&id).await;
            resumed += 1;
        }
        if resumed > 0 {
            tracing::info!(count = resumed, "resumed reconciliation tasks");
        }
        Ok(resumed)
    }

    /// Stop polling and forget the task. The instance keeps its last state.
    pub async fn cancel(&self, instance_id: &str) -> ControlResult<bool> {
        let was_running = self.abort_running(instance_id).await;
        let was_persisted = self.load(instance_id).await?.is_some();
        self.clear(instance_id).await?;
        Ok(was_running || was_persisted)
    }

    pub async fn list(&self) -> ControlResult<Vec<ReconcileTask>> {
        let mut out = Vec::new();
        for id in self.inner.registry.list_ids(RECONCILIATIONS_KEY).await? {
            if let Some(task) = self.load(&id).await? {
                out.push(task);
            }
        }
        Ok(out)
    }

    pub async fn is_running(&self, instance_id: &str) -> bool {
        self.inner
            .tasks
            .lock()
            .await
            .get(instance_id)
            .is_some_and(|(_, h)| !h.is_finished())
    }

    async fn abort_running(&self, instance_id: &str) -> bool {
        match self.inner.tasks.lock().await.remove(instance_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn spawn(&self, instance_id: &str) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let id = instance_id.to_string();
        let span = tracing::info_span!("reconcile", instance = %instance_id);
        let handle = tokio::spawn(
            async move {
                match this.run(&id).await {
                    Ok(outcome) => tracing::info!(?outcome, "reconciliation finished"),
                    Err(err) => tracing::warn!(error = %err, "reconciliation aborted"),
                }
                let mut tasks = this.inner.tasks.lock().await;
                if tasks.get(&id).is_some_and(|(g, _)| *g == generation) {
                    tasks.remove(&id);
                }
            }
            .instrument(span),
        );

        let previous = self
            .inner
            .tasks
            .lock()
            .await
            .insert(instance_id.to_string(), (generation, handle));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    async fn load(&self, instance_id: &str) -> ControlResult<Option<ReconcileTask>> {
        self.inner.registry.get_json(&reconcile_key(instance_id)).await
    }

    async fn persist(&self, task: &ReconcileTask) -> ControlResult<()> {
        self.inner
            .registry
            .set_json(&reconcile_key(&task.instance_id), task)
            .await
    }

    async fn clear(&self, instance_id: &str) -> ControlResult<()> {
        self.inner
            .registry
            .remove_id(RECONCILIATIONS_KEY, instance_id)
            .await?;
        self.inner.registry.delete(&reconcile_key(instance_id)).await
    }

    async fn mark_failed(&self, instance_id: &str) -> ControlResult<()> {
        match self
            .inner
            .registry
            .update_instance(instance_id, |i| i.internal_state = InternalState::Failed)
            .await
        {
            Ok(_) | Err(ControlError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Poll until READY, FAILED, a transport error, or the attempt ceiling.
    ///
    /// Non-2xx answers count as an attempt and polling continues; an unreachable
    /// node ends the run with FAILED.
    pub async fn run(&self, instance_id: &str) -> ControlResult<ReconcileOutcome> {
        let PollConfig {
            interval,
            max_attempts,
        } = self.inner.config;
        let mut task = self
            .load(instance_id)
            .await?
            .unwrap_or_else(|| ReconcileTask::fresh(instance_id));

        while task.attempts < max_attempts {
            tokio::time::sleep(interval).await;

            let Some(instance) = self.inner.registry.get_instance(instance_id).await? else {
                self.clear(instance_id).await?;
                return Ok(ReconcileOutcome::InstanceGone);
            };

            task.attempts += 1;
            task.last_poll_at = Some(Utc::now());
            self.persist(&task).await?;

            match self
                .inner
                .client
                .state(&instance.node, &instance.volume_id)
                .await
            {
                Ok(resp) => {
                    let reported = InternalState::from_remote(&resp.state);
                    let container_id = resp.container_id.filter(|c| !c.trim().is_empty());
                    let updated = self
                        .inner
                        .registry
                        .update_instance(instance_id, |i| {
                            if let Some(state) = reported {
                                i.internal_state = state;
                            }
                            if let Some(container_id) = container_id {
                                i.container_id = container_id;
                            }
                        })
                        .await;
                    match updated {
                        Ok(_) => {}
                        Err(ControlError::NotFound(_)) => {
                            self.clear(instance_id).await?;
                            return Ok(ReconcileOutcome::InstanceGone);
                        }
                        Err(err) => return Err(err),
                    }

                    tracing::debug!(attempt = task.attempts, state = %resp.state, "polled instance state");
                    match reported {
                        Some(InternalState::Ready) => {
                            self.clear(instance_id).await?;
                            return Ok(ReconcileOutcome::Ready);
                        }
                        Some(InternalState::Failed) => {
                            self.clear(instance_id).await?;
                            return Ok(ReconcileOutcome::Failed {
                                reason: "node reported FAILED".to_string(),
                            });
                        }
                        _ => {}
                    }
                }
                Err(NodeError::Rejected { status, message }) => {
                    tracing::warn!(attempt = task.attempts, status, %message, "state poll rejected");
                }
                Err(err) => {
                    tracing::warn!(attempt = task.attempts, error = %err, "state poll failed");
                    self.mark_failed(instance_id).await?;
                    self.clear(instance_id).await?;
                    return Ok(ReconcileOutcome::Failed {
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::warn!(attempts = task.attempts, "instance never became ready");
        self.mark_failed(instance_id).await?;
        self.clear(instance_id).await?;
        Ok(ReconcileOutcome::Failed {
            reason: format!("not ready after {} attempts", task.attempts),
        })
    }
}
