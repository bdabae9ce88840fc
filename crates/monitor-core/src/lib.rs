//! Shared core abstractions for the alerting monitor control plane.
//!
//! This crate defines cross-crate contracts used by the store, the task
//! executor and the API: the error type with its surfacing kinds, the data
//! model of versioned alert definitions, receivers and reconciliation tasks,
//! the injectable clock, and the adapter traits the executor drives.
//!
//! # API notes
//! `monitor-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`) as
//! part of the control-plane contract.

use async_trait::async_trait;
use std::fmt;

pub mod auth;
pub mod clock;
pub mod email;
pub mod model;
pub mod template;

pub use clock::{Clock, ManualClock, SystemClock};
pub use email::EmailAddress;
pub use model::{
    Category, DefinitionDetails, DefinitionValues, EntityState, ReceiverDetails, Task, TaskState,
    TaskTarget, ValueBounds,
};

/// Tenant id used for the legacy single-tenant deployment.
pub const DEFAULT_TENANT: &str = "edgenode";

pub type Result<T> = std::result::Result<T, Error>;

/// How an error must be surfaced at the API and handled by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store lookup failed: 404 at the API, task goes `Invalid` at the executor.
    NotFound,
    /// Duration/threshold outside its `[min, max]` bounds: 400.
    ValueOutOfBounds,
    /// Parse or validation failure: 400.
    BadRequest,
    /// Missing or invalid token: 401.
    Unauthorized,
    /// Downstream transport failure: 500 at the API, retried at the executor.
    DependencyUnavailable,
    /// Unexpected: 500, retried at the executor.
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    inner: anyhow::Error,
}

impl Error {
    pub fn new(kind: ErrorKind, inner: anyhow::Error) -> Self {
        Self { kind, inner }
    }

    pub fn msg(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            inner: anyhow::anyhow!(message.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::NotFound, message)
    }

    pub fn out_of_bounds(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::ValueOutOfBounds, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::msg(ErrorKind::Unauthorized, message)
    }

    pub fn dependency(inner: anyhow::Error) -> Self {
        Self::new(ErrorKind::DependencyUnavailable, inner)
    }

    pub fn internal(inner: anyhow::Error) -> Self {
        Self::new(ErrorKind::Internal, inner)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether the executor may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::DependencyUnavailable | ErrorKind::Internal
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Internal,
            inner: value,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        let kind = match &value {
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        };
        Self {
            kind,
            inner: anyhow::Error::from(value),
        }
    }
}

/// Push of one definition version to the rules engine.
///
/// Implementations must be idempotent per `(uuid, version)`: the executor may
/// re-drive the same version after a timeout or crash.
#[async_trait]
pub trait RulerAdapter: Send + Sync {
    async fn update_definition_config(&self, definition: &DefinitionDetails) -> Result<()>;
}

/// Push of one receiver version into the notification dispatcher config.
#[async_trait]
pub trait DispatcherAdapter: Send + Sync {
    async fn update_receiver_config(&self, receiver: &ReceiverDetails) -> Result<()>;
}

/// Storage for the dispatcher configuration document.
///
/// In the reference deployment this is a cluster secret keyed `custom.yaml`;
/// tests use an in-memory store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get(&self) -> Result<String>;
    async fn put(&self, document: String) -> Result<()>;
}
