use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::protocol::{transitional_deploy, transitional_lock};
use crate::types::{
    DeployState, ElementCommand, ElementDigest, ElementId, ElementTypeId, ElementUpdate,
    InstanceDigest, InstanceId, LockState, StateChangeResult,
};

/// One element as recorded by the participant that owns it.
#[derive(Debug, Clone)]
pub struct LocalElement {
    pub element_id: ElementId,
    pub instance_id: InstanceId,
    pub definition: ElementTypeId,
    pub definition_version: String,
    pub deploy_state: DeployState,
    pub lock_state: LockState,
    pub result: StateChangeResult,
    pub message: String,
    pub in_properties: Map<String, Value>,
    pub out_properties: Map<String, Value>,
    /// Highest command sequence recorded for this element.
    pub sequence: u64,
    /// Highest sequence reported back to the runtime.
    pub acked_sequence: u64,
}

/// What the intermediary should do with one inbound element command.
#[derive(Debug)]
pub enum CommandDisposition {
    /// New sequence recorded; invoke the handler.
    Accept(LocalElement),
    /// Duplicate of completed work; re-publish the recorded outcome.
    ReAck(LocalElement),
    /// Same sequence, handler still running.
    InFlight,
    /// Older than the recorded sequence.
    Superseded,
    /// Not owned by this participant.
    Unknown,
}

/// In-memory map of the elements one participant process owns. All state
/// the intermediary and reporter share goes through here, so a command and
/// its report always see one consistent record.
#[derive(Clone, Default)]
pub struct ElementStore {
    elements: Arc<RwLock<HashMap<ElementId, LocalElement>>>,
}

impl ElementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes the local record from a distributed definition.
    /// A refresh replaces definition and input properties, never the
    /// lifecycle state.
    pub fn upsert_from_update(&self, instance_id: InstanceId, update: &ElementUpdate) {
        let mut elements = self.elements.write().unwrap();
        match elements.get_mut(&update.element_id) {
            Some(element) => {
                element.definition = update.definition.clone();
                element.definition_version = update.definition_version.clone();
                element.in_properties = update.in_properties.clone();
            }
            None => {
                elements.insert(
                    update.element_id,
                    LocalElement {
                        element_id: update.element_id,
                        instance_id,
                        definition: update.definition.clone(),
                        definition_version: update.definition_version.clone(),
                        deploy_state: DeployState::Undeployed,
                        lock_state: LockState::Unlocked,
                        result: StateChangeResult::NoError,
                        message: String::new(),
                        in_properties: update.in_properties.clone(),
                        out_properties: Map::new(),
                        sequence: 0,
                        acked_sequence: 0,
                    },
                );
            }
        }
    }

    pub fn get(&self, element_id: ElementId) -> Option<LocalElement> {
        self.elements.read().unwrap().get(&element_id).cloned()
    }

    /// Sequence gate for inbound commands. A new sequence is recorded with
    /// its transitional state and refreshed input properties; a duplicate of
    /// already-reported work re-acks; everything else is dropped.
    pub fn record_command(&self, command: &ElementCommand) -> CommandDisposition {
        let mut elements = self.elements.write().unwrap();
        let Some(element) = elements.get_mut(&command.element_id) else {
            return CommandDisposition::Unknown;
        };

        if command.sequence < element.sequence {
            return CommandDisposition::Superseded;
        }
        if command.sequence == element.sequence {
            if element.acked_sequence >= command.sequence {
                return CommandDisposition::ReAck(element.clone());
            }
            return CommandDisposition::InFlight;
        }

        element.sequence = command.sequence;
        if let Some(properties) = &command.in_properties {
            element.in_properties = properties.clone();
        }
        if let Some(target) = command.target_deploy {
            element.deploy_state = transitional_deploy(target);
        }
        if let Some(target) = command.target_lock {
            element.lock_state = transitional_lock(target);
        }
        element.result = StateChangeResult::NoError;
        element.message.clear();
        CommandDisposition::Accept(element.clone())
    }

    /// Applies one handler report, attributed to the command that started
    /// the work. Only a report naming the currently-recorded sequence is
    /// accepted, at most once; a straggler whose command a newer sequence
    /// superseded reports a dead sequence and is dropped. The lock axis
    /// follows successful deploys (deployed starts locked, undeployed is
    /// unlocked), and a successful delete removes the record. Returns the
    /// snapshot to acknowledge, or None when there is nothing to report.
    pub fn apply_report(
        &self,
        element_id: ElementId,
        sequence: u64,
        deploy_state: Option<DeployState>,
        lock_state: Option<LockState>,
        result: StateChangeResult,
        message: &str,
    ) -> Option<LocalElement> {
        let mut elements = self.elements.write().unwrap();
        let element = elements.get_mut(&element_id)?;
        if sequence != element.sequence || element.acked_sequence >= element.sequence {
            return None;
        }

        if let Some(state) = deploy_state {
            element.deploy_state = state;
            if result == StateChangeResult::NoError {
                match state {
                    DeployState::Deployed => element.lock_state = LockState::Locked,
                    DeployState::Undeployed => element.lock_state = LockState::Unlocked,
                    _ => {}
                }
            }
        }
        if let Some(state) = lock_state {
            element.lock_state = state;
        }
        element.result = result;
        element.message = message.to_string();
        element.acked_sequence = sequence;

        let snapshot = element.clone();
        if deploy_state == Some(DeployState::Deleting) && result == StateChangeResult::NoError {
            elements.remove(&element_id);
        }
        Some(snapshot)
    }

    pub fn set_out_properties(&self, element_id: ElementId, properties: Map<String, Value>) -> bool {
        let mut elements = self.elements.write().unwrap();
        match elements.get_mut(&element_id) {
            Some(element) => {
                element.out_properties = properties;
                true
            }
            None => false,
        }
    }

    pub fn any_deployed(&self) -> bool {
        self.elements
            .read()
            .unwrap()
            .values()
            .any(|e| e.deploy_state == DeployState::Deployed)
    }

    /// Per-instance digest of locally owned elements, carried in heartbeats.
    pub fn digests(&self) -> Vec<InstanceDigest> {
        let elements = self.elements.read().unwrap();
        let mut grouped: BTreeMap<InstanceId, Vec<ElementDigest>> = BTreeMap::new();
        for element in elements.values() {
            grouped
                .entry(element.instance_id)
                .or_default()
                .push(ElementDigest {
                    element_id: element.element_id,
                    deploy_state: element.deploy_state,
                    lock_state: element.lock_state,
                });
        }
        grouped
            .into_iter()
            .map(|(instance_id, elements)| InstanceDigest {
                instance_id,
                elements,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.read().unwrap().is_empty()
    }
}
