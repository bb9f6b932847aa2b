//! Per-instance workflow automation.
//!
//! Each saved workflow becomes one named job keyed by instance id. A job sleeps until
//! the next fire time of its recurrence rule, re-reads the workflow from the workflow
//! file, runs the power actions and then the webhooks. Next fire times are always
//! recomputed from the rule; nothing about them is persisted.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use skyport_model::{Instance, PowerAction, Workflow};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::Instrument;

use crate::{
    error::{ControlError, ControlResult},
    node_client::NodeClient,
    registry::Registry,
    workflow_store::WorkflowFile,
};

/// `*/N` on the minute field: fires at every wall-clock minute divisible by N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecurrenceRule {
    every_minutes: u32,
}

impl RecurrenceRule {
    pub fn every_minutes(minutes: u32) -> ControlResult<Self> {
        if !(1..=60).contains(&minutes) {
            return Err(ControlError::InvalidWorkflow(format!(
                "interval must be between 1 and 60 minutes, got {minutes}"
            )));
        }
        Ok(Self {
            every_minutes: minutes,
        })
    }

    pub fn from_workflow(workflow: &Workflow) -> ControlResult<Self> {
        let minutes = workflow
            .interval_minutes()
            .ok_or_else(|| ControlError::InvalidWorkflow("missing interval block".to_string()))?;
        Self::every_minutes(minutes)
    }

    pub fn minutes(&self) -> u32 {
        self.every_minutes
    }

    /// First matching minute boundary strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let secs = after.timestamp();
        let minute_start = secs - secs.rem_euclid(60);
        let mut candidate = DateTime::from_timestamp(minute_start + 60, 0)
            .unwrap_or(after + TimeDelta::minutes(1));
        for _ in 0..60 {
            let minute = (candidate.timestamp().rem_euclid(3600) / 60) as u32;
            if minute % self.every_minutes == 0 {
                return candidate;
            }
            candidate += TimeDelta::minutes(1);
        }
        candidate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Idle,
    Scheduled,
    Executing,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub instance_id: String,
    pub every_minutes: u32,
    pub next_fire_at: DateTime<Utc>,
    pub state: JobState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Executed {
        actions: Vec<PowerAction>,
        webhooks_sent: usize,
    },
    /// Workflow file no longer has an entry; the job was cancelled.
    Orphaned,
    SkippedSuspended,
}

struct JobSlot {
    generation: u64,
    rule: RecurrenceRule,
    state: Arc<std::sync::Mutex<JobState>>,
    handle: JoinHandle<()>,
}

fn set_state(state: &std::sync::Mutex<JobState>, next: JobState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

fn get_state(state: &std::sync::Mutex<JobState>) -> JobState {
    *state.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    registry: Registry,
    client: NodeClient,
    file: WorkflowFile,
    jobs: Mutex<HashMap<String, JobSlot>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct WorkflowScheduler {
    inner: Arc<Inner>,
}

impl WorkflowScheduler {
    pub fn new(registry: Registry, client: NodeClient, file: WorkflowFile) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                client,
                file,
                jobs: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn file(&self) -> &WorkflowFile {
        &self.inner.file
    }

    /// Schedule every workflow found in the workflow file. Returns the job count.
    pub async fn start(&self) -> ControlResult<usize> {
        let all = self.inner.file.load_all().await?;
        let mut scheduled = 0;
        for (instance_id, workflow) in all {
            match RecurrenceRule::from_workflow(&workflow) {
                Ok(rule) => {
                    self.schedule(&instance_id, rule).await;
                    scheduled += 1;
                }
                Err(err) => {
                    tracing::warn!(instance = %instance_id, error = %err, "not scheduling workflow");
                }
            }
        }
        tracing::info!(jobs = scheduled, "workflow scheduler started");
        Ok(scheduled)
    }

    /// Replace any job for the instance, persist the workflow, then schedule it.
    pub async fn save(&self, instance_id: &str, workflow: &Workflow) -> ControlResult<JobInfo> {
        let rule = RecurrenceRule::from_workflow(workflow)?;
        self.cancel(instance_id).await;
        self.inner
            .registry
            .put_workflow(instance_id, workflow)
            .await?;
        self.inner.file.put(instance_id, workflow).await?;
        self.schedule(instance_id, rule).await;

        Ok(JobInfo {
            instance_id: instance_id.to_string(),
            every_minutes: rule.minutes(),
            next_fire_at: rule.next_after(Utc::now()),
            state: JobState::Scheduled,
        })
    }

    /// Cancel the job and drop the workflow from both the registry and the file.
    pub async fn remove(&self, instance_id: &str) -> ControlResult<()> {
        self.cancel(instance_id).await;
        self.inner.registry.delete_workflow(instance_id).await?;
        self.inner.file.remove(instance_id).await?;
        Ok(())
    }

    pub async fn cancel(&self, instance_id: &str) -> bool {
        let slot = self.inner.jobs.lock().await.remove(instance_id);
        match slot {
            Some(slot) => {
                slot.handle.abort();
                set_state(&slot.state, JobState::Idle);
                tracing::info!(instance = %instance_id, "workflow job cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn list(&self) -> Vec<JobInfo> {
        let now = Utc::now();
        let jobs = self.inner.jobs.lock().await;
        let mut out: Vec<JobInfo> = jobs
            .iter()
            .map(|(id, slot)| JobInfo {
                instance_id: id.clone(),
                every_minutes: slot.rule.minutes(),
                next_fire_at: slot.rule.next_after(now),
                state: get_state(&slot.state),
            })
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    pub async fn state(&self, instance_id: &str) -> JobState {
        self.inner
            .jobs
            .lock()
            .await
            .get(instance_id)
            .map(|slot| get_state(&slot.state))
            .unwrap_or(JobState::Idle)
    }

    async fn schedule(&self, instance_id: &str, rule: RecurrenceRule) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(std::sync::Mutex::new(JobState::Scheduled));

        let this = self.clone();
        let id = instance_id.to_string();
        let task_state = state.clone();
        let span = tracing::info_span!("workflow_job", instance = %instance_id);
        let handle = tokio::spawn(
            async move {
                loop {
                    let now = Utc::now();
                    let wait = (rule.next_after(now) - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;

                    set_state(&task_state, JobState::Executing);
                    let outcome = this.run_tick(&id).await;
                    set_state(&task_state, JobState::Scheduled);
                    match outcome {
                        Ok(TickOutcome::Orphaned) => {
                            this.forget(&id, generation).await;
                            break;
                        }
                        Ok(outcome) => tracing::debug!(?outcome, "workflow tick finished"),
                        Err(err) => tracing::warn!(error = %err, "workflow tick failed"),
                    }
                }
            }
            .instrument(span),
        );

        let previous = self.inner.jobs.lock().await.insert(
            instance_id.to_string(),
            JobSlot {
                generation,
                rule,
                state,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        tracing::info!(instance = %instance_id, every_minutes = rule.minutes(), "workflow job scheduled");
    }

    /// Remove a slot only if it is still the one the caller started.
    async fn forget(&self, instance_id: &str, generation: u64) {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.get(instance_id).is_some_and(|s| s.generation == generation) {
            jobs.remove(instance_id);
        }
    }

    /// Run one tick for an instance using the workflow currently on disk.
    pub async fn run_tick(&self, instance_id: &str) -> ControlResult<TickOutcome> {
        let Some(workflow) = self.inner.file.get(instance_id).await? else {
            tracing::info!(instance = %instance_id, "workflow entry gone; dropping job");
            return Ok(TickOutcome::Orphaned);
        };

        let instance = self.inner.registry.require_instance(instance_id).await?;
        if instance.is_suspended() {
            tracing::info!(instance = %instance_id, "instance suspended; skipping workflow tick");
            return Ok(TickOutcome::SkippedSuspended);
        }

        let actions: Vec<PowerAction> = workflow.power_actions().collect();
        for action in &actions {
            self.inner
                .client
                .power(&instance.node, &instance.container_id, *action)
                .await?;
        }

        let message = tick_message(&instance, &actions);
        let mut webhooks_sent = 0;
        for url in workflow.webhooks() {
            match self.notify(url, &message).await {
                Ok(()) => webhooks_sent += 1,
                Err(err) => tracing::warn!(%url, error = %err, "workflow webhook failed"),
            }
        }

        Ok(TickOutcome::Executed {
            actions,
            webhooks_sent,
        })
    }

    async fn notify(&self, url: &str, message: &str) -> Result<(), reqwest::Error> {
        self.inner
            .client
            .http()
            .post(url)
            .json(&serde_json::json!({ "content": message }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Cancel jobs whose instance no longer appears in the workflow file.
    pub async fn check_orphans(&self) -> ControlResult<Vec<String>> {
        let on_disk = self.inner.file.load_all().await?;
        let scheduled: Vec<String> = self.inner.jobs.lock().await.keys().cloned().collect();

        let mut cancelled = Vec::new();
        for id in scheduled {
            if !on_disk.contains_key(&id) && self.cancel(&id).await {
                tracing::warn!(instance = %id, "cancelled orphaned workflow job");
                cancelled.push(id);
            }
        }
        Ok(cancelled)
    }

    pub fn spawn_liveness(&self, every: Duration) {
        let this = self.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::time::sleep(every).await;
                    if let Err(err) = this.check_orphans().await {
                        tracing::warn!(error = %err, "workflow liveness check failed");
                    }
                }
            }
            .instrument(tracing::info_span!("workflow_liveness")),
        );
    }
}

fn tick_message(instance: &Instance, actions: &[PowerAction]) -> String {
    let actions = actions
        .iter()
        .map(|a| a.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if actions.is_empty() {
        format!("Workflow for {} ran.", instance.name)
    } else {
        format!("Workflow for {} ran: {actions}.", instance.name)
    }
}
