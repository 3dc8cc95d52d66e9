use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

use super::{
    DeployState, ElementId, ElementTypeId, InstanceId, LockState, MessageId, ParticipantId,
    ParticipantState, StateChangeResult,
};

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Envelope shared by every message on the wire, serialized with camelCase
/// keys (`messageId`, `participantId`). `participant_id` names the target
/// for runtime-origin messages (None = every participant) and the sender
/// for participant-origin messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub participant_id: Option<ParticipantId>,
    pub version: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Wire payloads, discriminated by the `messageType` field. Matching on this
/// enum replaces string dispatch: a message is classified exactly once, at
/// the decode boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    ParticipantRegister(ParticipantRegister),
    ParticipantRegisterAck(ParticipantAck),
    ParticipantDeregister,
    ParticipantDeregisterAck(ParticipantAck),
    ParticipantStatus(ParticipantStatus),
    /// Runtime-origin probe asking the target to heartbeat immediately.
    ParticipantStatusReq,
    /// Pushes element definitions and input properties to one participant
    /// ahead of the first deploy. Untracked: a lost update surfaces as a
    /// deploy timeout.
    AutomationCompositionUpdate(CompositionUpdate),
    /// Batched lifecycle commands for the elements one participant owns.
    AutomationCompositionStateChange(CompositionStateChange),
    /// Singular per-element outcome report, echoing the command sequence.
    AutomationCompositionAck(ElementAck),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRegister {
    pub supported_element_types: Vec<ElementTypeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantAck {
    pub response_to: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantStatus {
    pub state: ParticipantState,
    pub compositions: Vec<InstanceDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionUpdate {
    pub instance_id: InstanceId,
    pub elements: Vec<ElementUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementUpdate {
    pub element_id: ElementId,
    pub definition: ElementTypeId,
    pub definition_version: String,
    pub in_properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionStateChange {
    pub instance_id: InstanceId,
    pub elements: Vec<ElementCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementCommand {
    pub element_id: ElementId,
    pub sequence: u64,
    pub target_deploy: Option<DeployState>,
    pub target_lock: Option<LockState>,
    pub in_properties: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementAck {
    pub instance_id: InstanceId,
    pub element_id: ElementId,
    pub sequence: u64,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    pub result: StateChangeResult,
    pub message: String,
    pub out_properties: Option<Map<String, Value>>,
}

/// Compact per-instance state carried in heartbeats. Liveness and
/// observability only; reconciliation stays ack-driven.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDigest {
    pub instance_id: InstanceId,
    pub elements: Vec<ElementDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDigest {
    pub element_id: ElementId,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
}

impl Message {
    pub fn new(participant_id: Option<ParticipantId>, body: MessageBody) -> Self {
        Self {
            message_id: MessageId::new_v4(),
            timestamp: Utc::now(),
            participant_id,
            version: PROTOCOL_VERSION.to_string(),
            body,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn message_type(&self) -> &str {
        match self.body {
            MessageBody::ParticipantRegister(_) => "PARTICIPANT_REGISTER",
            MessageBody::ParticipantRegisterAck(_) => "PARTICIPANT_REGISTER_ACK",
            MessageBody::ParticipantDeregister => "PARTICIPANT_DEREGISTER",
            MessageBody::ParticipantDeregisterAck(_) => "PARTICIPANT_DEREGISTER_ACK",
            MessageBody::ParticipantStatus(_) => "PARTICIPANT_STATUS",
            MessageBody::ParticipantStatusReq => "PARTICIPANT_STATUS_REQ",
            MessageBody::AutomationCompositionUpdate(_) => "AUTOMATION_COMPOSITION_UPDATE",
            MessageBody::AutomationCompositionStateChange(_) => {
                "AUTOMATION_COMPOSITION_STATE_CHANGE"
            }
            MessageBody::AutomationCompositionAck(_) => "AUTOMATION_COMPOSITION_ACK",
        }
    }
}
