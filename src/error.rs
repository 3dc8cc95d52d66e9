use thiserror::Error;

use crate::types::{DefinitionId, ElementId, InstanceId, ParticipantId};

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failure modes of the orchestration protocol. Stale messages and deadline
/// misses are recovered internally (logged, bounded retry); the rest surface
/// to the caller or degrade the instance aggregate.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid state transition for instance {instance_id}: {from} -> {to}")]
    InvalidStateTransition {
        instance_id: InstanceId,
        from: String,
        to: String,
    },

    #[error("instance {instance_id} has operations in flight")]
    OperationInProgress { instance_id: InstanceId },

    #[error("stale report for element {element_id}: sequence {sequence} already superseded by {acked}")]
    StaleMessage {
        element_id: ElementId,
        sequence: u64,
        acked: u64,
    },

    #[error("participant {participant_id} is unresponsive")]
    ParticipantUnresponsive { participant_id: ParticipantId },

    #[error("element {element_id} execution failed: {message}")]
    ElementExecutionFailed { element_id: ElementId, message: String },

    #[error("instance {instance_id} not found")]
    InstanceNotFound { instance_id: InstanceId },

    #[error("element {element_id} not found")]
    ElementNotFound { element_id: ElementId },

    #[error("definition {definition_id} not found")]
    DefinitionNotFound { definition_id: DefinitionId },

    #[error("no registered participant supports element type {element_type}")]
    NoParticipantForType { element_type: String },

    #[error("message codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("transport failure: {0}")]
    Transport(String),
}
