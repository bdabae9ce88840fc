//! Asynchronous reconciliation executor.
//!
//! One executor runs per process; replicas are distinguished by their
//! `owner_uuid`. At every tick of the pooling rate it claims a batch of
//! pending tasks, invalidates superseded versions, and spawns one worker
//! per task. Workers run under the task timeout, so a hung downstream call
//! never blocks the next tick from claiming independent work; tasks held by
//! dead workers are reclaimed by the periodic timeout sweep.

use monitor_core::{
    DispatcherAdapter, EntityState, ErrorKind, Result, RulerAdapter, Task, TaskTarget,
};
use monitor_store::Store;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

const TIMEOUT_SWEEP_TICKS: u64 = 30;
const RETENTION_SWEEP_TICKS: u64 = 720;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Interval between queue polls.
    pub pooling_rate: Duration,
    /// Deadline for one adapter invocation.
    pub task_timeout: Duration,
    /// Retries granted to one task before it terminates as `Invalid`.
    pub retry_limit: i32,
    /// How long terminal tasks are kept before deletion.
    pub retention_time: Duration,
    /// Claim batch size (distinct entity UUIDs per tick).
    pub uuid_limit: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pooling_rate: Duration::from_secs(5),
            task_timeout: Duration::from_secs(30),
            retry_limit: 3,
            retention_time: Duration::from_secs(24 * 3600),
            uuid_limit: 10,
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    store: Store,
    ruler: Arc<dyn RulerAdapter>,
    dispatcher: Arc<dyn DispatcherAdapter>,
    cfg: ExecutorConfig,
    owner_uuid: Uuid,
}

impl Executor {
    pub fn new(
        store: Store,
        ruler: Arc<dyn RulerAdapter>,
        dispatcher: Arc<dyn DispatcherAdapter>,
        cfg: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            ruler,
            dispatcher,
            cfg,
            owner_uuid: Uuid::new_v4(),
        }
    }

    pub fn owner_uuid(&self) -> Uuid {
        self.owner_uuid
    }

    /// Drive the tick loop until the shutdown channel flips.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            event = "monitor.executor.started",
            owner_uuid = %self.owner_uuid,
            "executor started"
        );

        self.run_retention_sweep().await;

        let mut tick: u64 = 0;
        loop {
            if *shutdown_rx.borrow() {
                tracing::info!(event = "monitor.executor.stopped", "executor stopped");
                return Ok(());
            }

            tick += 1;
            match self.tick_once().await {
                // Workers are detached; the timeout bounds their lifetime.
                Ok(_handles) => {}
                Err(err) => {
                    tracing::warn!(
                        event = "monitor.executor.tick.error",
                        error = %err,
                        "tick failed"
                    );
                }
            }

            if tick % TIMEOUT_SWEEP_TICKS == 0 {
                self.run_timeout_sweep().await;
            }
            if tick % RETENTION_SWEEP_TICKS == 0 {
                self.run_retention_sweep().await;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.pooling_rate) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// Claim one batch, invalidate superseded versions, and spawn one
    /// worker per claimed task. Returns the worker handles so callers that
    /// need completion (tests, drain-on-shutdown) can await them.
    pub async fn tick_once(&self) -> Result<Vec<JoinHandle<()>>> {
        let tasks = self
            .store
            .get_pending_tasks(self.owner_uuid, self.cfg.uuid_limit)
            .await?;
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        self.store.set_older_versions_to_invalid(&tasks).await?;

        tracing::info!(
            event = "monitor.executor.claimed",
            owner_uuid = %self.owner_uuid,
            count = tasks.len(),
            "claimed pending tasks"
        );

        let handles = tasks
            .into_iter()
            .map(|task| {
                let executor = self.clone();
                tokio::spawn(async move { executor.process_task(task).await })
            })
            .collect();
        Ok(handles)
    }

    async fn run_timeout_sweep(&self) {
        match self
            .store
            .fail_timed_out_tasks(self.cfg.task_timeout, self.cfg.retry_limit)
            .await
        {
            Ok(sweep) if sweep.retried > 0 || sweep.invalidated > 0 => {
                tracing::warn!(
                    event = "monitor.executor.timeout_sweep",
                    retried = sweep.retried,
                    invalidated = sweep.invalidated,
                    "reclaimed timed out tasks"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    event = "monitor.executor.timeout_sweep.error",
                    error = %err,
                    "timeout sweep failed"
                );
            }
        }
    }

    async fn run_retention_sweep(&self) {
        match self
            .store
            .delete_terminal_tasks(self.cfg.retention_time)
            .await
        {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(
                    event = "monitor.executor.retention",
                    deleted,
                    "deleted terminal tasks past retention"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    event = "monitor.executor.retention.error",
                    error = %err,
                    "retention sweep failed"
                );
            }
        }
    }

    async fn process_task(&self, task: Task) {
        let applied = tokio::time::timeout(self.cfg.task_timeout, self.apply_task(&task)).await;

        let recorded = match applied {
            Ok(Ok(())) => self.store.set_task_applied(&task).await,
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(
                    event = "monitor.executor.task.orphaned",
                    task_id = task.id,
                    error = %err,
                    "companion entity missing, invalidating task"
                );
                self.store.set_task_state_invalid(&task).await
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    event = "monitor.executor.task.failed",
                    task_id = task.id,
                    error = %err,
                    "task failed"
                );
                self.store.set_task_failed(&task, self.cfg.retry_limit).await
            }
            Err(_elapsed) => {
                tracing::warn!(
                    event = "monitor.executor.task.timeout",
                    task_id = task.id,
                    "task timed out"
                );
                self.store.set_task_failed(&task, self.cfg.retry_limit).await
            }
        };

        if let Err(err) = recorded {
            tracing::error!(
                event = "monitor.executor.task.record_error",
                task_id = task.id,
                error = %err,
                "failed to record task outcome"
            );
        }
    }

    async fn apply_task(&self, task: &Task) -> Result<()> {
        match task.target {
            TaskTarget::Definition(uuid) => {
                let definition = self
                    .store
                    .get_definition(&task.tenant_id, uuid, task.version)
                    .await?;
                self.store
                    .set_definition_state(&task.tenant_id, uuid, task.version, EntityState::Pending)
                    .await?;
                self.ruler.update_definition_config(&definition).await
            }
            TaskTarget::Receiver(uuid) => {
                let receiver = self
                    .store
                    .get_receiver(&task.tenant_id, uuid, task.version)
                    .await?;
                self.store
                    .set_receiver_state(&task.tenant_id, uuid, task.version, EntityState::Pending)
                    .await?;
                self.dispatcher.update_receiver_config(&receiver).await
            }
        }
    }
}
