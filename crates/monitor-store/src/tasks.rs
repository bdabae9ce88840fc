//! Reconciliation task queue.
//!
//! Claims follow an at-most-one-owner discipline per `(tenant, uuid)`: a
//! pair is claimable only while it has no task in `Taken`. The claim
//! transaction runs under serializable isolation plus explicit row locks on
//! the candidate set, so two replicas evaluating the predicate concurrently
//! cannot both claim the same pair; losers retry on serialization failure.

use crate::Store;
use anyhow::Context;
use chrono::{DateTime, Utc};
use monitor_core::{Error, Result, Task, TaskState, TaskTarget};
use sqlx::{postgres::PgRow, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

const CLAIM_ATTEMPTS: usize = 3;

const TASK_COLUMNS: &str = r#"
    SELECT id, owner_uuid, state, alert_definition_uuid, receiver_uuid,
           tenant_id, version, creation_date, start_date, completion_date, retry_count
    FROM monitor.tasks
"#;

/// Outcome of one timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutSweep {
    /// Tasks returned to the queue as `Error` with a bumped retry count.
    pub retried: u64,
    /// Tasks that exhausted their retries and terminated as `Invalid`.
    pub invalidated: u64,
}

impl Store {
    /// Claim up to `limit` tasks for `owner`.
    ///
    /// One task per claimable `(tenant, uuid)` pair: the pair must have a
    /// task in `{New, Error}` and none in `Taken`; the highest-version
    /// pending task of each pair is taken. Claimed tasks are atomically
    /// marked `Taken` with `start_date = now` and returned ordered by
    /// ascending task id.
    pub async fn get_pending_tasks(&self, owner: Uuid, limit: i64) -> Result<Vec<Task>> {
        let mut attempt = 0;
        loop {
            match self.try_claim(owner, limit).await {
                Ok(tasks) => return Ok(tasks),
                Err(err) if is_serialization_failure(&err) && attempt + 1 < CLAIM_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(
                        event = "monitor.store.claim.retry",
                        attempt,
                        "claim serialization conflict, retrying"
                    );
                }
                Err(err) => return Err(Error::internal(err)),
            }
        }
    }

    async fn try_claim(&self, owner: Uuid, limit: i64) -> anyhow::Result<Vec<Task>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("begin claim tx")?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .context("set claim isolation level")?;

        let sql = format!(
            r#"{TASK_COLUMNS}
            WHERE state IN ('New', 'Error')
              AND NOT EXISTS (
                SELECT 1
                FROM monitor.tasks taken
                WHERE taken.tenant_id = monitor.tasks.tenant_id
                  AND COALESCE(taken.alert_definition_uuid, taken.receiver_uuid)
                      = COALESCE(monitor.tasks.alert_definition_uuid, monitor.tasks.receiver_uuid)
                  AND taken.state = 'Taken'
              )
            ORDER BY id
            FOR UPDATE OF tasks
            "#
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *tx)
            .await
            .context("select pending tasks")?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            candidates.push(task_from_row(row).map_err(anyhow::Error::from)?);
        }

        let mut picked = pick_claimable(candidates, limit);
        if picked.is_empty() {
            tx.commit().await.context("commit empty claim tx")?;
            return Ok(picked);
        }

        let ids: Vec<i64> = picked.iter().map(|task| task.id).collect();
        sqlx::query(
            r#"
            UPDATE monitor.tasks
            SET state = 'Taken', owner_uuid = $1, start_date = $2
            WHERE id = ANY($3)
            "#,
        )
        .bind(owner)
        .bind(now)
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("mark tasks taken")?;

        tx.commit().await.context("commit claim tx")?;

        for task in &mut picked {
            task.state = TaskState::Taken;
            task.owner_uuid = Some(owner);
            task.start_date = Some(now);
        }
        Ok(picked)
    }

    /// For each input task, invalidate every older pending task of the same
    /// `(tenant, uuid)` pair. Tasks in `Taken`/`Applied` are never touched.
    pub async fn set_older_versions_to_invalid(&self, tasks: &[Task]) -> Result<u64> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("begin invalidate tx")?;

        let mut invalidated = 0;
        for task in tasks {
            let updated = sqlx::query(
                r#"
                UPDATE monitor.tasks
                SET state = 'Invalid', completion_date = $4
                WHERE tenant_id = $1
                  AND COALESCE(alert_definition_uuid, receiver_uuid) = $2
                  AND state IN ('New', 'Error')
                  AND version < $3
                "#,
            )
            .bind(&task.tenant_id)
            .bind(task.target.uuid())
            .bind(task.version)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("invalidate older task versions")?;
            invalidated += updated.rows_affected();
        }

        tx.commit().await.context("commit invalidate tx")?;
        Ok(invalidated)
    }

    /// Task → `Applied`, companion entity version → `Applied`, one
    /// transaction.
    pub async fn set_task_applied(&self, task: &Task) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("begin applied tx")?;

        sqlx::query(
            r#"
            UPDATE monitor.tasks
            SET state = 'Applied', completion_date = $2
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("mark task applied")?;

        set_entity_state_in_tx(&mut tx, task, "Applied").await?;
        tx.commit().await.context("commit applied tx")?;
        Ok(())
    }

    /// Retryable failure: below `retry_limit` the task returns to the queue
    /// as `Error` with a bumped retry count; at the limit it terminates as
    /// `Invalid`. The companion entity version goes `Error` either way.
    pub async fn set_task_failed(&self, task: &Task, retry_limit: i32) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("begin failed tx")?;

        fail_task_in_tx(&mut tx, task.id, retry_limit, now).await?;
        set_entity_state_in_tx(&mut tx, task, "Error").await?;
        tx.commit().await.context("commit failed tx")?;
        Ok(())
    }

    /// Terminal failure: task → `Invalid`, companion entity version →
    /// `Error`.
    pub async fn set_task_invalid(&self, task: &Task) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.context("begin invalid tx")?;

        sqlx::query(
            r#"
            UPDATE monitor.tasks
            SET state = 'Invalid', completion_date = $2
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("mark task invalid")?;

        set_entity_state_in_tx(&mut tx, task, "Error").await?;
        tx.commit().await.context("commit invalid tx")?;
        Ok(())
    }

    /// Task → `Invalid` without touching any entity. Used when the
    /// companion row does not exist.
    pub async fn set_task_state_invalid(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE monitor.tasks
            SET state = 'Invalid', completion_date = $2
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await
        .context("mark task state invalid")?;
        Ok(())
    }

    /// Reclaim tasks whose worker died: every `Taken` task started more than
    /// `timeout` ago is failed through the retry path.
    pub async fn fail_timed_out_tasks(
        &self,
        timeout: Duration,
        retry_limit: i32,
    ) -> Result<TimeoutSweep> {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(timeout)
                .context("timeout out of range")
                .map_err(Error::internal)?;

        let mut tx = self.pool.begin().await.context("begin sweep tx")?;

        let sql = format!(
            r#"{TASK_COLUMNS}
            WHERE state = 'Taken'
              AND start_date < $1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .context("select timed out tasks")?;

        let mut sweep = TimeoutSweep::default();
        for row in &rows {
            let task = task_from_row(row)?;
            let terminal = fail_task_in_tx(&mut tx, task.id, retry_limit, now).await?;
            set_entity_state_in_tx(&mut tx, &task, "Error").await?;
            if terminal {
                sweep.invalidated += 1;
            } else {
                sweep.retried += 1;
            }
        }

        tx.commit().await.context("commit sweep tx")?;
        Ok(sweep)
    }

    /// Drop terminal tasks older than the retention window.
    pub async fn delete_terminal_tasks(&self, retention: Duration) -> Result<u64> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(retention)
                .context("retention out of range")
                .map_err(Error::internal)?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM monitor.tasks
            WHERE state IN ('Applied', 'Invalid')
              AND completion_date < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("delete terminal tasks")?;

        Ok(deleted.rows_affected())
    }
}

/// Apply the retry-or-terminate transition to one task row. Returns true
/// when the task terminated as `Invalid`.
async fn fail_task_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    task_id: i64,
    retry_limit: i32,
    now: DateTime<Utc>,
) -> Result<bool> {
    let state: String = sqlx::query_scalar(
        r#"
        UPDATE monitor.tasks
        SET state = CASE WHEN retry_count < $2 THEN 'Error' ELSE 'Invalid' END,
            completion_date = CASE WHEN retry_count < $2 THEN completion_date ELSE $3 END,
            retry_count = CASE WHEN retry_count < $2 THEN retry_count + 1 ELSE retry_count END
        WHERE id = $1
        RETURNING state
        "#,
    )
    .bind(task_id)
    .bind(retry_limit)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .context("mark task failed")?;

    Ok(state == "Invalid")
}

async fn set_entity_state_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    task: &Task,
    state: &str,
) -> Result<()> {
    let (table, uuid) = match task.target {
        TaskTarget::Definition(uuid) => ("alert_definitions", uuid),
        TaskTarget::Receiver(uuid) => ("receivers", uuid),
    };
    let sql = format!(
        r#"
        UPDATE monitor.{table}
        SET state = $4
        WHERE tenant_id = $1
          AND uuid = $2
          AND version = $3
        "#
    );
    sqlx::query(&sql)
        .bind(&task.tenant_id)
        .bind(uuid)
        .bind(task.version)
        .bind(state)
        .execute(&mut **tx)
        .await
        .context("mirror entity state")?;
    Ok(())
}

/// Highest-version pending task per `(tenant, uuid)` pair, at most `limit`
/// of them, ordered by ascending task id.
fn pick_claimable(candidates: Vec<Task>, limit: i64) -> Vec<Task> {
    let mut best: HashMap<(String, Uuid), Task> = HashMap::new();
    for task in candidates {
        let key = (task.tenant_id.clone(), task.target.uuid());
        match best.get(&key) {
            Some(current) if current.version >= task.version => {}
            _ => {
                best.insert(key, task);
            }
        }
    }

    let mut picked: Vec<Task> = best.into_values().collect();
    picked.sort_by_key(|task| task.id);
    picked.truncate(limit.max(0) as usize);
    picked
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    let state: String = row.try_get("state").context("state")?;
    let definition_uuid: Option<Uuid> = row
        .try_get("alert_definition_uuid")
        .context("alert_definition_uuid")?;
    let receiver_uuid: Option<Uuid> = row.try_get("receiver_uuid").context("receiver_uuid")?;

    Ok(Task {
        id: row.try_get("id").context("id")?,
        owner_uuid: row.try_get("owner_uuid").context("owner_uuid")?,
        state: TaskState::parse(&state)?,
        target: TaskTarget::from_columns(definition_uuid, receiver_uuid)?,
        tenant_id: row.try_get("tenant_id").context("tenant_id")?,
        version: row.try_get("version").context("version")?,
        creation_date: row.try_get("creation_date").context("creation_date")?,
        start_date: row.try_get("start_date").context("start_date")?,
        completion_date: row.try_get("completion_date").context("completion_date")?,
        retry_count: row.try_get("retry_count").context("retry_count")?,
    })
}

fn is_serialization_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|err| err.as_database_error())
        .and_then(|db| db.code())
        .is_some_and(|code| code == "40001")
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_core::TaskState;

    fn task(id: i64, tenant: &str, uuid: Uuid, version: i64) -> Task {
        Task {
            id,
            owner_uuid: None,
            state: TaskState::New,
            target: TaskTarget::Definition(uuid),
            tenant_id: tenant.to_string(),
            version,
            creation_date: Utc::now(),
            start_date: None,
            completion_date: None,
            retry_count: 0,
        }
    }

    #[test]
    fn picks_highest_version_per_pair() {
        let uuid = Uuid::new_v4();
        let picked = pick_claimable(
            vec![
                task(1, "edgenode", uuid, 1),
                task(2, "edgenode", uuid, 3),
                task(3, "edgenode", uuid, 2),
            ],
            10,
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, 2);
        assert_eq!(picked[0].version, 3);
    }

    #[test]
    fn orders_by_task_id_and_honours_limit() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let picked = pick_claimable(
            vec![
                task(5, "edgenode", c, 1),
                task(2, "edgenode", a, 1),
                task(3, "edgenode", b, 1),
            ],
            2,
        );
        let ids: Vec<i64> = picked.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn same_uuid_in_two_tenants_is_two_pairs() {
        let uuid = Uuid::new_v4();
        let picked = pick_claimable(
            vec![task(1, "tenant-a", uuid, 1), task(2, "tenant-b", uuid, 1)],
            10,
        );
        assert_eq!(picked.len(), 2);
    }
}
