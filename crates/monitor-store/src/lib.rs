//! Postgres repository for versioned alert configuration.
//!
//! The store owns every row of the `monitor` schema. Entities (alert
//! definitions and receivers) are persisted as immutable versions; a client
//! mutation inserts a `version + 1` row in state `Modified` together with a
//! `New` reconciliation task, in one transaction. Only the `state` column of
//! an existing row is ever updated in place.
//!
//! Every timestamp written here comes from the injected [`Clock`].

use monitor_core::{Clock, Result};
use sqlx::PgPool;
use std::sync::Arc;

mod definitions;
mod receivers;
mod tasks;

pub use tasks::TimeoutSweep;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("pool", &"<PgPool>")
            .field("clock", &"<Clock>")
            .finish()
    }
}

impl Store {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded schema migrations.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|err| monitor_core::Error::internal(anyhow::Error::from(err)))?;
        Ok(())
    }
}
