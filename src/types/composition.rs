use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    DefinitionId, DeployState, ElementId, ElementTypeId, InstanceId, LockState, ParticipantId,
    StateChangeResult,
};

/// Immutable catalog entry describing one composition. Created once, never
/// mutated while instances reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub version: String,
    pub elements: Vec<ElementDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDefinition {
    pub id: ElementTypeId,
    pub version: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionInstance {
    pub instance_id: InstanceId,
    pub definition_id: DefinitionId,
    pub name: String,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    pub result: StateChangeResult,
    pub elements: HashMap<ElementId, Element>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub element_id: ElementId,
    pub definition: ElementTypeId,
    pub definition_version: String,
    pub participant_id: ParticipantId,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    pub result: StateChangeResult,
    pub in_properties: Map<String, Value>,
    pub out_properties: Map<String, Value>,
    pub message: String,
    /// Highest command sequence ever issued for this element.
    pub sequence: u64,
    /// Highest sequence for which a report (ack or timeout verdict) has
    /// been applied. Anything at or below it is stale.
    pub acked_sequence: u64,
    pub last_updated: DateTime<Utc>,
}

/// In-flight command awaiting its ack. Ephemeral: lives in the registry's
/// pending table, never persisted.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub element_id: ElementId,
    pub participant_id: ParticipantId,
    pub sequence: u64,
    pub target_deploy: Option<DeployState>,
    pub target_lock: Option<LockState>,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub retries: u32,
}

impl CompositionInstance {
    pub fn new(definition_id: DefinitionId, name: String) -> Self {
        Self {
            instance_id: InstanceId::new_v4(),
            definition_id,
            name,
            deploy_state: DeployState::Commissioned,
            lock_state: LockState::Unlocked,
            result: StateChangeResult::NoError,
            elements: HashMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl Element {
    pub fn new(definition: &ElementDefinition, participant_id: ParticipantId) -> Self {
        Self {
            element_id: ElementId::new_v4(),
            definition: definition.id.clone(),
            definition_version: definition.version.clone(),
            participant_id,
            deploy_state: DeployState::Commissioned,
            lock_state: LockState::Unlocked,
            result: StateChangeResult::NoError,
            in_properties: definition.properties.clone(),
            out_properties: Map::new(),
            message: String::new(),
            sequence: 0,
            acked_sequence: 0,
            last_updated: Utc::now(),
        }
    }

    /// Allocates the next command sequence number for this element.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}
