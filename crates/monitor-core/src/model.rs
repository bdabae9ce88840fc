//! Data model of the versioned configuration store.
//!
//! Every logical entity is tenant-scoped, identified by a stable UUID, and
//! persisted as immutable rows with a monotonically increasing `version`.
//! Only the `state` column of a row ever mutates.

use crate::email::EmailAddress;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a definition or receiver version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityState {
    New,
    Modified,
    Pending,
    Applied,
    Error,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::New => "New",
            EntityState::Modified => "Modified",
            EntityState::Pending => "Pending",
            EntityState::Applied => "Applied",
            EntityState::Error => "Error",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "New" => Ok(EntityState::New),
            "Modified" => Ok(EntityState::Modified),
            "Pending" => Ok(EntityState::Pending),
            "Applied" => Ok(EntityState::Applied),
            "Error" => Ok(EntityState::Error),
            other => Err(Error::bad_request(format!("invalid entity state `{other}`"))),
        }
    }
}

/// Lifecycle state of a reconciliation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    New,
    Taken,
    Applied,
    Error,
    Invalid,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "New",
            TaskState::Taken => "Taken",
            TaskState::Applied => "Applied",
            TaskState::Error => "Error",
            TaskState::Invalid => "Invalid",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "New" => Ok(TaskState::New),
            "Taken" => Ok(TaskState::Taken),
            "Applied" => Ok(TaskState::Applied),
            "Error" => Ok(TaskState::Error),
            "Invalid" => Ok(TaskState::Invalid),
            other => Err(Error::bad_request(format!("invalid task state `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Performance,
    Health,
    Maintenance,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Performance => "performance",
            Category::Health => "health",
            Category::Maintenance => "maintenance",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "performance" => Ok(Category::Performance),
            "health" => Ok(Category::Health),
            "maintenance" => Ok(Category::Maintenance),
            other => Err(Error::bad_request(format!("invalid category `{other}`"))),
        }
    }
}

/// A value together with its inclusive validation bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueBounds {
    pub value: i64,
    pub min: i64,
    pub max: i64,
}

impl ValueBounds {
    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// One alert definition version joined with its duration and threshold rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionDetails {
    pub uuid: Uuid,
    pub version: i64,
    pub name: String,
    pub template: String,
    pub category: Category,
    pub context: String,
    pub severity: String,
    pub alert_interval: i64,
    pub enabled: bool,
    pub state: EntityState,
    pub tenant_id: String,
    pub duration: ValueBounds,
    pub threshold: ValueBounds,
}

/// Patch payload for a definition; absent fields inherit the previous
/// version's values.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefinitionValues {
    pub duration: Option<i64>,
    pub threshold: Option<i64>,
    pub enabled: Option<bool>,
}

impl DefinitionValues {
    pub fn is_empty(&self) -> bool {
        self.duration.is_none() && self.threshold.is_none() && self.enabled.is_none()
    }
}

/// One receiver version joined with its email config and recipient set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverDetails {
    pub uuid: Uuid,
    pub version: i64,
    pub name: String,
    pub state: EntityState,
    pub tenant_id: String,
    pub mail_server: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
}

/// Which entity a task reconciles. Stored as two nullable UUID columns with
/// an exactly-one-populated CHECK; in memory it is a tagged variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTarget {
    Definition(Uuid),
    Receiver(Uuid),
}

impl TaskTarget {
    pub fn uuid(&self) -> Uuid {
        match self {
            TaskTarget::Definition(uuid) | TaskTarget::Receiver(uuid) => *uuid,
        }
    }

    /// `(alert_definition_uuid, receiver_uuid)` column pair for binds.
    pub fn columns(&self) -> (Option<Uuid>, Option<Uuid>) {
        match self {
            TaskTarget::Definition(uuid) => (Some(*uuid), None),
            TaskTarget::Receiver(uuid) => (None, Some(*uuid)),
        }
    }

    pub fn from_columns(definition: Option<Uuid>, receiver: Option<Uuid>) -> Result<Self> {
        match (definition, receiver) {
            (Some(uuid), None) => Ok(TaskTarget::Definition(uuid)),
            (None, Some(uuid)) => Ok(TaskTarget::Receiver(uuid)),
            _ => Err(Error::internal(anyhow::anyhow!(
                "task must reference exactly one of definition/receiver"
            ))),
        }
    }
}

/// Persistent queue record describing one pending reconciliation of an
/// `(entity, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: i64,
    pub owner_uuid: Option<Uuid>,
    pub state: TaskState,
    pub target: TaskTarget,
    pub tenant_id: String,
    pub version: i64,
    pub creation_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_state_round_trips() {
        for state in [
            EntityState::New,
            EntityState::Modified,
            EntityState::Pending,
            EntityState::Applied,
            EntityState::Error,
        ] {
            assert_eq!(EntityState::parse(state.as_str()).unwrap(), state);
        }
        assert!(EntityState::parse("Done").is_err());
    }

    #[test]
    fn task_state_round_trips() {
        for state in [
            TaskState::New,
            TaskState::Taken,
            TaskState::Applied,
            TaskState::Error,
            TaskState::Invalid,
        ] {
            assert_eq!(TaskState::parse(state.as_str()).unwrap(), state);
        }
        assert!(TaskState::parse("Running").is_err());
    }

    #[test]
    fn category_rejects_unknown_members() {
        assert_eq!(Category::parse("health").unwrap(), Category::Health);
        assert!(Category::parse("Health").is_err());
        assert!(Category::parse("network").is_err());
    }

    #[test]
    fn task_target_requires_exactly_one_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(
            TaskTarget::from_columns(Some(uuid), None).unwrap(),
            TaskTarget::Definition(uuid)
        );
        assert_eq!(
            TaskTarget::from_columns(None, Some(uuid)).unwrap(),
            TaskTarget::Receiver(uuid)
        );
        assert!(TaskTarget::from_columns(None, None).is_err());
        assert!(TaskTarget::from_columns(Some(uuid), Some(uuid)).is_err());
    }
}
