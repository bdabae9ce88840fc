//! Receiver operations.

use crate::Store;
use anyhow::Context;
use monitor_core::{EmailAddress, EntityState, Error, ReceiverDetails, Result};
use sqlx::{postgres::PgRow, Postgres, Row, Transaction};
use uuid::Uuid;

const RECEIVER_COLUMNS: &str = r#"
    SELECT r.id, r.uuid, r.version, r.name, r.state, r.tenant_id,
           c.mail_server,
           f.email AS from_email, f.first_name AS from_first, f.last_name AS from_last
    FROM monitor.receivers r
    JOIN monitor.email_configs c ON c.id = r.email_config_id
    JOIN monitor.email_addresses f ON f.id = c.from_address_id
"#;

impl Store {
    /// Latest non-`Error` version of every receiver the tenant has.
    pub async fn get_receivers(&self, tenant_id: &str) -> Result<Vec<ReceiverDetails>> {
        let sql = format!(
            r#"{RECEIVER_COLUMNS}
            WHERE r.tenant_id = $1
              AND r.state <> 'Error'
              AND r.version = (
                SELECT max(v.version)
                FROM monitor.receivers v
                WHERE v.tenant_id = r.tenant_id
                  AND v.uuid = r.uuid
                  AND v.state <> 'Error'
              )
            ORDER BY r.uuid
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .context("list receivers")?;

        let mut receivers = Vec::with_capacity(rows.len());
        for row in rows {
            receivers.push(self.receiver_from_row(&row).await?);
        }
        Ok(receivers)
    }

    /// Latest non-`Error` version of one receiver.
    pub async fn get_latest_receiver(
        &self,
        tenant_id: &str,
        uuid: Uuid,
    ) -> Result<ReceiverDetails> {
        let sql = format!(
            r#"{RECEIVER_COLUMNS}
            WHERE r.tenant_id = $1
              AND r.uuid = $2
              AND r.state <> 'Error'
            ORDER BY r.version DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .context("fetch latest receiver")?
            .ok_or_else(|| Error::not_found(format!("receiver {uuid} not found")))?;

        self.receiver_from_row(&row).await
    }

    /// Exact `(tenant, uuid, version)` lookup.
    pub async fn get_receiver(
        &self,
        tenant_id: &str,
        uuid: Uuid,
        version: i64,
    ) -> Result<ReceiverDetails> {
        let sql = format!(
            r#"{RECEIVER_COLUMNS}
            WHERE r.tenant_id = $1
              AND r.uuid = $2
              AND r.version = $3
            "#
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(uuid)
            .bind(version)
            .fetch_optional(&self.pool)
            .await
            .context("fetch receiver version")?
            .ok_or_else(|| {
                Error::not_found(format!("receiver {uuid} version {version} not found"))
            })?;

        self.receiver_from_row(&row).await
    }

    /// Persist a new receiver version with the given recipient set and
    /// enqueue its reconciliation task. Returns the new version number.
    ///
    /// Addresses are upserted by their unique email; duplicates within the
    /// input are rejected with `BadRequest`.
    pub async fn set_receiver_recipients(
        &self,
        tenant_id: &str,
        uuid: Uuid,
        recipients: &[EmailAddress],
    ) -> Result<i64> {
        for (i, recipient) in recipients.iter().enumerate() {
            if recipients[..i].iter().any(|r| r.email == recipient.email) {
                return Err(Error::bad_request(format!(
                    "duplicate recipient `{}`",
                    recipient.email
                )));
            }
        }

        let mut tx = self.pool.begin().await.context("begin set_recipients tx")?;

        let previous = sqlx::query(
            r#"
            SELECT version, name, email_config_id
            FROM monitor.receivers
            WHERE tenant_id = $1
              AND uuid = $2
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(uuid)
        .fetch_optional(&mut *tx)
        .await
        .context("fetch latest receiver for update")?
        .ok_or_else(|| Error::not_found(format!("receiver {uuid} not found")))?;

        let prev_version: i64 = previous.try_get("version").context("version")?;
        let name: String = previous.try_get("name").context("name")?;
        let email_config_id: i64 = previous
            .try_get("email_config_id")
            .context("email_config_id")?;
        let new_version = prev_version + 1;

        let receiver_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO monitor.receivers
              (uuid, name, state, version, email_config_id, tenant_id)
            VALUES ($1, $2, 'Modified', $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(&name)
        .bind(new_version)
        .bind(email_config_id)
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await
        .context("insert receiver version")?;

        for recipient in recipients {
            let address_id = upsert_address(&mut tx, recipient).await?;
            sqlx::query(
                r#"
                INSERT INTO monitor.email_recipients (receiver_id, email_address_id)
                VALUES ($1, $2)
                "#,
            )
            .bind(receiver_id)
            .bind(address_id)
            .execute(&mut *tx)
            .await
            .context("insert email recipient")?;
        }

        sqlx::query(
            r#"
            INSERT INTO monitor.tasks
              (state, receiver_uuid, tenant_id, version, creation_date)
            VALUES ('New', $1, $2, $3, $4)
            "#,
        )
        .bind(uuid)
        .bind(tenant_id)
        .bind(new_version)
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await
        .context("insert receiver task")?;

        tx.commit().await.context("commit set_recipients tx")?;
        Ok(new_version)
    }

    /// In-place state transition of one receiver version.
    pub async fn set_receiver_state(
        &self,
        tenant_id: &str,
        uuid: Uuid,
        version: i64,
        state: EntityState,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE monitor.receivers
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
        .context("update receiver state")?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "receiver {uuid} version {version} not found"
            )));
        }
        Ok(())
    }

    async fn receiver_from_row(&self, row: &PgRow) -> Result<ReceiverDetails> {
        let receiver_id: i64 = row.try_get("id").context("id")?;
        let state: String = row.try_get("state").context("state")?;

        let recipient_rows = sqlx::query(
            r#"
            SELECT a.email, a.first_name, a.last_name
            FROM monitor.email_recipients j
            JOIN monitor.email_addresses a ON a.id = j.email_address_id
            WHERE j.receiver_id = $1
            ORDER BY a.email
            "#,
        )
        .bind(receiver_id)
        .fetch_all(&self.pool)
        .await
        .context("fetch receiver recipients")?;

        let to = recipient_rows
            .iter()
            .map(|r| {
                Ok(EmailAddress {
                    email: r.try_get("email").context("email")?,
                    first_name: r.try_get("first_name").context("first_name")?,
                    last_name: r.try_get("last_name").context("last_name")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ReceiverDetails {
            uuid: row.try_get("uuid").context("uuid")?,
            version: row.try_get("version").context("version")?,
            name: row.try_get("name").context("name")?,
            state: EntityState::parse(&state)?,
            tenant_id: row.try_get("tenant_id").context("tenant_id")?,
            mail_server: row.try_get("mail_server").context("mail_server")?,
            from: EmailAddress {
                email: row.try_get("from_email").context("from_email")?,
                first_name: row.try_get("from_first").context("from_first")?,
                last_name: row.try_get("from_last").context("from_last")?,
            },
            to,
        })
    }
}

async fn upsert_address(
    tx: &mut Transaction<'_, Postgres>,
    address: &EmailAddress,
) -> Result<i64> {
    // Existing addresses are reused by their unique email; names are not
    // rewritten on reuse.
    sqlx::query(
        r#"
        INSERT INTO monitor.email_addresses (email, first_name, last_name)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO NOTHING
        "#,
    )
    .bind(&address.email)
    .bind(&address.first_name)
    .bind(&address.last_name)
    .execute(&mut **tx)
    .await
    .context("insert email address")?;

    let id: i64 = sqlx::query_scalar(
        r#"
        SELECT id
        FROM monitor.email_addresses
        WHERE email = $1
        "#,
    )
    .bind(&address.email)
    .fetch_one(&mut **tx)
    .await
    .context("fetch email address id")?;

    Ok(id)
}
