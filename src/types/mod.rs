pub mod composition;
pub mod message;
pub mod participant;

pub use composition::{
    CompositionDefinition, CompositionInstance, Element, ElementDefinition, PendingOperation,
};
pub use message::{
    CompositionStateChange, CompositionUpdate, ElementAck, ElementCommand, ElementDigest,
    ElementUpdate, InstanceDigest, Message, MessageBody, ParticipantAck, ParticipantRegister,
    ParticipantStatus,
};
pub use participant::Participant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type InstanceId = Uuid;
pub type ElementId = Uuid;
pub type ParticipantId = Uuid;
pub type DefinitionId = Uuid;
pub type MessageId = Uuid;

/// Element type name, e.g. "org.ensemble.element.HttpServer".
pub type ElementTypeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployState {
    Commissioned, // definition primed, nothing distributed yet
    Deploying,
    Deployed,
    Undeploying,
    Undeployed,
    Deleting,
}

impl DeployState {
    pub fn as_str(&self) -> &str {
        match self {
            DeployState::Commissioned => "COMMISSIONED",
            DeployState::Deploying => "DEPLOYING",
            DeployState::Deployed => "DEPLOYED",
            DeployState::Undeploying => "UNDEPLOYING",
            DeployState::Undeployed => "UNDEPLOYED",
            DeployState::Deleting => "DELETING",
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            DeployState::Deploying | DeployState::Undeploying | DeployState::Deleting
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Locked,
    Unlocked,
    Locking,
    Unlocking,
}

impl LockState {
    pub fn as_str(&self) -> &str {
        match self {
            LockState::Locked => "LOCKED",
            LockState::Unlocked => "UNLOCKED",
            LockState::Locking => "LOCKING",
            LockState::Unlocking => "UNLOCKING",
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, LockState::Locking | LockState::Unlocking)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateChangeResult {
    NoError,
    Failed,
    Timeout,
}

impl StateChangeResult {
    pub fn as_str(&self) -> &str {
        match self {
            StateChangeResult::NoError => "NO_ERROR",
            StateChangeResult::Failed => "FAILED",
            StateChangeResult::Timeout => "TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantState {
    Unknown,    // registered but never confirmed
    Passive,    // confirmed, no deployed elements
    Active,     // at least one deployed element
    Terminated, // deregistered
}

impl ParticipantState {
    pub fn as_str(&self) -> &str {
        match self {
            ParticipantState::Unknown => "UNKNOWN",
            ParticipantState::Passive => "PASSIVE",
            ParticipantState::Active => "ACTIVE",
            ParticipantState::Terminated => "TERMINATED",
        }
    }
}

/// Liveness axis, orthogonal to the lifecycle axis above. Only the
/// supervisor demotes health; any heartbeat restores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantHealth {
    Unknown,
    Healthy,
    NotHealthy, // heartbeat overdue, probe sent
    OffLine,    // heartbeat past the full status window
}

impl ParticipantHealth {
    pub fn as_str(&self) -> &str {
        match self {
            ParticipantHealth::Unknown => "UNKNOWN",
            ParticipantHealth::Healthy => "HEALTHY",
            ParticipantHealth::NotHealthy => "NOT_HEALTHY",
            ParticipantHealth::OffLine => "OFF_LINE",
        }
    }
}
