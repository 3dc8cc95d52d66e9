use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;

use crate::error::{OrchestratorError, Result};
use crate::protocol::recompute;
use crate::storage::InstanceStore;
use crate::types::{
    CompositionInstance, DefinitionId, DeployState, Element, ElementAck, ElementId, InstanceId,
    PendingOperation, StateChangeResult,
};

/// Authoritative bookkeeping for composition instances: reconciles acks and
/// supervision verdicts into the persisted record, tracks in-flight
/// operations, and serializes all read-modify-write cycles per instance.
/// Different instances reconcile concurrently.
pub struct InstanceRegistry {
    store: Arc<dyn InstanceStore>,
    locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<HashMap<InstanceId, HashMap<ElementId, PendingOperation>>>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Takes the per-instance lock. Every mutation of an instance record,
    /// its pending table included, happens under this guard.
    pub async fn lock_instance(&self, instance_id: InstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(locks.entry(instance_id).or_default())
        };
        lock.lock_owned().await
    }

    pub fn has_pending(&self, instance_id: InstanceId) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.get(&instance_id).is_some_and(|ops| !ops.is_empty())
    }

    pub fn pending_for(&self, instance_id: InstanceId) -> Vec<PendingOperation> {
        let pending = self.pending.lock().unwrap();
        pending
            .get(&instance_id)
            .map(|ops| ops.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instances_with_pending(&self) -> Vec<InstanceId> {
        let pending = self.pending.lock().unwrap();
        pending
            .iter()
            .filter(|(_, ops)| !ops.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn insert_pending(&self, instance_id: InstanceId, ops: Vec<PendingOperation>) {
        let mut pending = self.pending.lock().unwrap();
        let table = pending.entry(instance_id).or_default();
        for op in ops {
            table.insert(op.element_id, op);
        }
    }

    pub fn remove_pending(
        &self,
        instance_id: InstanceId,
        element_id: ElementId,
    ) -> Option<PendingOperation> {
        let mut pending = self.pending.lock().unwrap();
        pending.get_mut(&instance_id)?.remove(&element_id)
    }

    /// Drops the lock and pending entries of a removed instance.
    pub(crate) fn forget(&self, instance_id: InstanceId) {
        self.pending.lock().unwrap().remove(&instance_id);
        self.locks.lock().unwrap().remove(&instance_id);
    }

    /// Instantiates a definition, assigning every element to the first
    /// registered participant that supports its type.
    pub async fn create_instance(
        &self,
        definition_id: DefinitionId,
        name: String,
    ) -> Result<CompositionInstance> {
        let definition = self
            .store
            .find_definition(definition_id)
            .await?
            .ok_or(OrchestratorError::DefinitionNotFound { definition_id })?;
        let participants = self.store.list_participants().await?;

        let mut instance = CompositionInstance::new(definition_id, name);
        for element_def in &definition.elements {
            let owner = participants
                .iter()
                .find(|p| p.supports(&element_def.id))
                .ok_or_else(|| OrchestratorError::NoParticipantForType {
                    element_type: element_def.id.clone(),
                })?;
            let element = Element::new(element_def, owner.participant_id);
            instance.elements.insert(element.element_id, element);
        }

        self.store.save_instance(&instance).await?;
        log::info!(
            "instance {} created from definition {} with {} elements",
            instance.instance_id,
            definition_id,
            instance.elements.len()
        );
        Ok(instance)
    }

    /// Applies one participant report. Stale sequences are rejected before
    /// anything is touched; a DELETING report with NO_ERROR drains the
    /// element and, once the map empties, the instance itself.
    pub async fn apply_ack(&self, ack: &ElementAck) -> Result<()> {
        let _guard = self.lock_instance(ack.instance_id).await;

        let mut instance = self
            .store
            .find_instance(ack.instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound {
                instance_id: ack.instance_id,
            })?;
        let element = instance
            .elements
            .get_mut(&ack.element_id)
            .ok_or(OrchestratorError::ElementNotFound {
                element_id: ack.element_id,
            })?;

        if ack.sequence <= element.acked_sequence {
            return Err(OrchestratorError::StaleMessage {
                element_id: ack.element_id,
                sequence: ack.sequence,
                acked: element.acked_sequence,
            });
        }

        element.deploy_state = ack.deploy_state;
        element.lock_state = ack.lock_state;
        element.result = ack.result;
        element.message = ack.message.clone();
        if let Some(out) = &ack.out_properties {
            element.out_properties = out.clone();
        }
        element.acked_sequence = ack.sequence;
        element.last_updated = Utc::now();

        self.remove_pending(ack.instance_id, ack.element_id);
        log::debug!(
            "element {} now {}/{} ({})",
            ack.element_id,
            ack.deploy_state.as_str(),
            ack.lock_state.as_str(),
            ack.result.as_str()
        );

        if ack.deploy_state == DeployState::Deleting && ack.result == StateChangeResult::NoError {
            instance.elements.remove(&ack.element_id);
            if instance.elements.is_empty() {
                self.store.delete_instance(ack.instance_id).await?;
                self.forget(ack.instance_id);
                log::info!("instance {} deleted", ack.instance_id);
                return Ok(());
            }
        }

        recompute(&mut instance);
        self.store.save_instance(&instance).await?;
        Ok(())
    }

    /// Records a FAILED/TIMEOUT verdict for an in-flight operation, leaving
    /// the element parked in its transitional state. Passes through the same
    /// sequence guard as acks so a verdict can never clobber a newer report.
    /// Caller holds the instance lock.
    pub async fn apply_verdict(
        &self,
        instance_id: InstanceId,
        element_id: ElementId,
        sequence: u64,
        result: StateChangeResult,
        message: &str,
    ) -> Result<()> {
        let mut instance = self
            .store
            .find_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound { instance_id })?;
        let element = instance
            .elements
            .get_mut(&element_id)
            .ok_or(OrchestratorError::ElementNotFound { element_id })?;

        if sequence <= element.acked_sequence {
            return Err(OrchestratorError::StaleMessage {
                element_id,
                sequence,
                acked: element.acked_sequence,
            });
        }

        element.result = result;
        element.message = message.to_string();
        element.acked_sequence = sequence;
        element.last_updated = Utc::now();

        self.remove_pending(instance_id, element_id);
        recompute(&mut instance);
        self.store.save_instance(&instance).await?;
        log::warn!(
            "element {} of instance {} marked {}: {}",
            element_id,
            instance_id,
            result.as_str(),
            message
        );
        Ok(())
    }

    /// Replaces the input properties of one element, the precursor to a
    /// redeploy that pushes changed configuration. Rejected while the
    /// element has a command in flight.
    pub async fn update_in_properties(
        &self,
        instance_id: InstanceId,
        element_id: ElementId,
        properties: Map<String, Value>,
    ) -> Result<()> {
        let _guard = self.lock_instance(instance_id).await;

        let in_flight = {
            let pending = self.pending.lock().unwrap();
            pending
                .get(&instance_id)
                .is_some_and(|ops| ops.contains_key(&element_id))
        };
        if in_flight {
            return Err(OrchestratorError::OperationInProgress { instance_id });
        }

        let mut instance = self
            .store
            .find_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound { instance_id })?;
        let element = instance
            .elements
            .get_mut(&element_id)
            .ok_or(OrchestratorError::ElementNotFound { element_id })?;

        element.in_properties = properties;
        element.last_updated = Utc::now();
        self.store.save_instance(&instance).await?;
        Ok(())
    }

    /// Direct removal for instances that never went through the participant
    /// round trip. Anything once distributed is deleted via a DELETING
    /// dispatch instead.
    pub async fn delete_instance(&self, instance_id: InstanceId) -> Result<()> {
        let _guard = self.lock_instance(instance_id).await;

        let instance = self
            .store
            .find_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound { instance_id })?;

        if self.has_pending(instance_id) {
            return Err(OrchestratorError::OperationInProgress { instance_id });
        }
        if !matches!(
            instance.deploy_state,
            DeployState::Commissioned | DeployState::Undeployed
        ) {
            return Err(OrchestratorError::InvalidStateTransition {
                instance_id,
                from: instance.deploy_state.as_str().to_string(),
                to: DeployState::Deleting.as_str().to_string(),
            });
        }

        self.store.delete_instance(instance_id).await?;
        self.forget(instance_id);
        log::info!("instance {} removed", instance_id);
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<CompositionInstance> {
        self.store
            .find_instance(instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound { instance_id })
    }
}
