//! Alert definition operations.

use crate::Store;
use anyhow::Context;
use monitor_core::{
    template, Category, DefinitionDetails, DefinitionValues, EntityState, Error, Result,
    ValueBounds,
};
use sqlx::{postgres::PgRow, Row};
use uuid::Uuid;

const DEFINITION_COLUMNS: &str = r#"
    SELECT d.uuid, d.version, d.name, d.template, d.state, d.category, d.context,
           d.severity, d.alert_interval, d.enabled, d.tenant_id,
           dur.duration, dur.duration_min, dur.duration_max,
           thr.threshold, thr.threshold_min, thr.threshold_max
    FROM monitor.alert_definitions d
    JOIN monitor.alert_durations dur ON dur.alert_definition_id = d.id
    JOIN monitor.alert_thresholds thr ON thr.alert_definition_id = d.id
"#;

impl Store {
    /// Latest non-`Error` version of every definition the tenant has.
    pub async fn get_definitions(&self, tenant_id: &str) -> Result<Vec<DefinitionDetails>> {
        let sql = format!(
            r#"{DEFINITION_COLUMNS}
            WHERE d.tenant_id = $1
              AND d.state <> 'Error'
              AND d.version = (
                SELECT max(v.version)
                FROM monitor.alert_definitions v
                WHERE v.tenant_id = d.tenant_id
                  AND v.uuid = d.uuid
                  AND v.state <> 'Error'
              )
            ORDER BY d.uuid
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .context("list alert definitions")?;

        rows.iter().map(definition_from_row).collect()
    }

    /// Latest non-`Error` version of one definition.
    pub async fn get_latest_definition(
        &self,
        tenant_id: &str,
        uuid: Uuid,
    ) -> Result<DefinitionDetails> {
        let sql = format!(
            r#"{DEFINITION_COLUMNS}
            WHERE d.tenant_id = $1
              AND d.uuid = $2
              AND d.state <> 'Error'
            ORDER BY d.version DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .context("fetch latest alert definition")?
            .ok_or_else(|| Error::not_found(format!("alert definition {uuid} not found")))?;

        definition_from_row(&row)
    }

    /// Exact `(tenant, uuid, version)` lookup.
    pub async fn get_definition(
        &self,
        tenant_id: &str,
        uuid: Uuid,
        version: i64,
    ) -> Result<DefinitionDetails> {
        let sql = format!(
            r#"{DEFINITION_COLUMNS}
            WHERE d.tenant_id = $1
              AND d.uuid = $2
              AND d.version = $3
            "#
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(uuid)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .context("fetch alert definition version")?
            .ok_or_else(|| {
                Error::not_found(format!("alert definition {uuid} version {version} not found"))
            })?;

        definition_from_row(&row)
    }

    /// Persist a new definition version with the patched values and enqueue
    /// its reconciliation task. Returns the new version number.
    ///
    /// Values outside their `[min, max]` bounds roll the whole transaction
    /// back with `ValueOutOfBounds`; absent values inherit the previous
    /// version's.
    pub async fn set_definition_values(
        &self,
        tenant_id: &str,
        uuid: Uuid,
        values: &DefinitionValues,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("begin set_values tx")?;

        let previous = sqlx::query(
            r#"
            SELECT d.id, d.version, d.name, d.template, d.category, d.context,
                   d.severity, d.alert_interval, d.enabled,
                   dur.name AS duration_name, dur.duration, dur.duration_min, dur.duration_max,
                   thr.name AS threshold_name, thr.threshold, thr.threshold_min, thr.threshold_max
            FROM monitor.alert_definitions d
            JOIN monitor.alert_durations dur ON dur.alert_definition_id = d.id
            JOIN monitor.alert_thresholds thr ON thr.alert_definition_id = d.id
            WHERE d.tenant_id = $1
              AND d.uuid = $2
            ORDER BY d.version DESC
            LIMIT 1
            FOR UPDATE OF d
            "#,
        )
        .bind(tenant_id)
        .bind(uuid)
        .fetch_optional(&mut *tx)
        .await
        .context("fetch latest alert definition for update")?
        .ok_or_else(|| Error::not_found(format!("alert definition {uuid} not found")))?;

        let prev_version: i64 = previous.try_get("version").context("version")?;
        let duration = ValueBounds {
            value: previous.try_get("duration").context("duration")?,
            min: previous.try_get("duration_min").context("duration_min")?,
            max: previous.try_get("duration_max").context("duration_max")?,
        };
        let threshold = ValueBounds {
            value: previous.try_get("threshold").context("threshold")?,
            min: previous.try_get("threshold_min").context("threshold_min")?,
            max: previous.try_get("threshold_max").context("threshold_max")?,
        };

        let new_duration = values.duration.unwrap_or(duration.value);
        let new_threshold = values.threshold.unwrap_or(threshold.value);
        if !duration.contains(new_duration) || !threshold.contains(new_threshold) {
            return Err(Error::out_of_bounds("alert definition value/s out-of-bounds"));
        }

        let prev_template: String = previous.try_get("template").context("template")?;
        let prev_enabled: bool = previous.try_get("enabled").context("enabled")?;
        let rendered = template::render(&prev_template, new_duration, new_threshold);
        let enabled = values.enabled.unwrap_or(prev_enabled);
        let new_version = prev_version + 1;

        let name: String = previous.try_get("name").context("name")?;
        let category: String = previous.try_get("category").context("category")?;
        let context: String = previous.try_get("context").context("context")?;
        let severity: String = previous.try_get("severity").context("severity")?;
        let alert_interval: i64 = previous.try_get("alert_interval").context("alert_interval")?;

        let definition_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO monitor.alert_definitions
              (uuid, version, name, template, state, category, context, severity,
               alert_interval, enabled, tenant_id)
            VALUES ($1, $2, $3, $4, 'Modified', $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(new_version)
        .bind(&name)
        .bind(&rendered)
        .bind(&category)
        .bind(&context)
        .bind(&severity)
        .bind(alert_interval)
        .bind(enabled)
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await
        .context("insert alert definition version")?;

        let duration_name: String = previous.try_get("duration_name").context("duration_name")?;
        sqlx::query(
            r#"
            INSERT INTO monitor.alert_durations
              (name, duration, duration_min, duration_max, alert_definition_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&duration_name)
        .bind(new_duration)
        .bind(duration.min)
        .bind(duration.max)
        .bind(definition_id)
        .execute(&mut *tx)
        .await
        .context("insert alert duration")?;

        let threshold_name: String = previous
            .try_get("threshold_name")
            .context("threshold_name")?;
        sqlx::query(
            r#"
            INSERT INTO monitor.alert_thresholds
              (name, threshold, threshold_min, threshold_max, alert_definition_id)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&threshold_name)
        .bind(new_threshold)
        .bind(threshold.min)
        .bind(threshold.max)
        .bind(definition_id)
        .execute(&mut *tx)
        .await
        .context("insert alert threshold")?;

        sqlx::query(
            r#"
            INSERT INTO monitor.tasks
              (state, alert_definition_uuid, tenant_id, version, creation_date)
            VALUES ('New', $1, $2, $3, $4)
            "#,
        )
        .bind(uuid)
        .bind(tenant_id)
        .bind(new_version)
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await
        .context("insert definition task")?;

        tx.commit().await.context("commit set_values tx")?;
        Ok(new_version)
    }

    /// In-place state transition of one definition version.
    pub async fn set_definition_state(
        &self,
        tenant_id: &str,
        uuid: Uuid,
        version: i64,
        state: EntityState,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE monitor.alert_definitions
            SET state = $4
            WHERE tenant_id = $1
              AND uuid = $2
              AND version = $3
            "#,
        )
        .bind(tenant_id)
        .bind(uuid)
        .bind(version)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .context("update alert definition state")?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "alert definition {uuid} version {version} not found"
            )));
        }
        Ok(())
    }
}

fn definition_from_row(row: &PgRow) -> Result<DefinitionDetails> {
    let state: String = row.try_get("state").context("state")?;
    let category: String = row.try_get("category").context("category")?;

    Ok(DefinitionDetails {
        uuid: row.try_get("uuid").context("uuid")?,
        version: row.try_get("version").context("version")?,
        name: row.try_get("name").context("name")?,
        template: row.try_get("template").context("template")?,
        category: Category::parse(&category)?,
        context: row.try_get("context").context("context")?,
        severity: row.try_get("severity").context("severity")?,
        alert_interval: row.try_get("alert_interval").context("alert_interval")?,
        enabled: row.try_get("enabled").context("enabled")?,
        state: EntityState::parse(&state)?,
        tenant_id: row.try_get("tenant_id").context("tenant_id")?,
        duration: ValueBounds {
            value: row.try_get("duration").context("duration")?,
            min: row.try_get("duration_min").context("duration_min")?,
            max: row.try_get("duration_max").context("duration_max")?,
        },
        threshold: ValueBounds {
            value: row.try_get("threshold").context("threshold")?,
            min: row.try_get("threshold_min").context("threshold_min")?,
            max: row.try_get("threshold_max").context("threshold_max")?,
        },
    })
}
