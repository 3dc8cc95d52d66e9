use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::config::IntermediaryConfig;
use crate::error::Result;
use crate::transport::Transport;
use crate::types::{
    DeployState, ElementAck, ElementId, InstanceId, LockState, Message, MessageBody,
    ParticipantId, ParticipantState, ParticipantStatus, StateChangeResult,
};

use super::store::{ElementStore, LocalElement};

/// Owns every message a participant sends: element acknowledgements and
/// heartbeat statuses. Handlers call in when their backend work completes,
/// naming the sequence of the command that started it; each accepted report
/// updates the local record and publishes exactly one ack echoing that
/// originating sequence.
pub struct StateReporter {
    participant_id: ParticipantId,
    topic: String,
    transport: Arc<dyn Transport>,
    store: ElementStore,
    state: Mutex<ParticipantState>,
}

impl StateReporter {
    pub fn new(
        config: &IntermediaryConfig,
        transport: Arc<dyn Transport>,
        store: ElementStore,
    ) -> Self {
        Self {
            participant_id: config.participant_id,
            topic: config.topic.clone(),
            transport,
            store,
            state: Mutex::new(ParticipantState::Unknown),
        }
    }

    /// The participant state carried in heartbeats: Unknown until the
    /// runtime acknowledges registration, Terminated after stop, otherwise
    /// Active while anything is deployed here and Passive when idle.
    pub fn state(&self) -> ParticipantState {
        let base = *self.state.lock().unwrap();
        match base {
            ParticipantState::Unknown | ParticipantState::Terminated => base,
            _ => {
                if self.store.any_deployed() {
                    ParticipantState::Active
                } else {
                    ParticipantState::Passive
                }
            }
        }
    }

    pub fn set_state(&self, state: ParticipantState) {
        *self.state.lock().unwrap() = state;
    }

    /// Reports the outcome of a deploy-axis command.
    pub async fn deploy_state_changed(
        &self,
        instance_id: InstanceId,
        element_id: ElementId,
        sequence: u64,
        deploy_state: DeployState,
        result: StateChangeResult,
        message: &str,
    ) -> Result<()> {
        match self
            .store
            .apply_report(element_id, sequence, Some(deploy_state), None, result, message)
        {
            Some(element) => self.publish_ack(&element).await,
            None => {
                log::debug!(
                    "deploy report at sequence {} for element {} of instance {} not applied",
                    sequence,
                    element_id,
                    instance_id
                );
                Ok(())
            }
        }
    }

    /// Reports the outcome of a lock-axis command.
    pub async fn lock_state_changed(
        &self,
        instance_id: InstanceId,
        element_id: ElementId,
        sequence: u64,
        lock_state: LockState,
        result: StateChangeResult,
        message: &str,
    ) -> Result<()> {
        match self
            .store
            .apply_report(element_id, sequence, None, Some(lock_state), result, message)
        {
            Some(element) => self.publish_ack(&element).await,
            None => {
                log::debug!(
                    "lock report at sequence {} for element {} of instance {} not applied",
                    sequence,
                    element_id,
                    instance_id
                );
                Ok(())
            }
        }
    }

    /// Records fresh output properties for an element and publishes a status
    /// so the runtime hears about them without waiting for the next command.
    pub async fn element_out_properties(
        &self,
        element_id: ElementId,
        properties: Map<String, Value>,
    ) -> Result<()> {
        if self.store.set_out_properties(element_id, properties) {
            self.publish_status().await
        } else {
            log::debug!("out-properties for unknown element {} dropped", element_id);
            Ok(())
        }
    }

    /// One heartbeat: participant state plus the per-instance element digest.
    pub async fn publish_status(&self) -> Result<()> {
        let msg = Message::new(
            Some(self.participant_id),
            MessageBody::ParticipantStatus(ParticipantStatus {
                state: self.state(),
                compositions: self.store.digests(),
            }),
        );
        self.transport.publish(&self.topic, msg.to_json()?).await
    }

    pub(crate) async fn publish_ack(&self, element: &LocalElement) -> Result<()> {
        let msg = Message::new(
            Some(self.participant_id),
            MessageBody::AutomationCompositionAck(ElementAck {
                instance_id: element.instance_id,
                element_id: element.element_id,
                sequence: element.acked_sequence,
                deploy_state: element.deploy_state,
                lock_state: element.lock_state,
                result: element.result,
                message: element.message.clone(),
                out_properties: (!element.out_properties.is_empty())
                    .then(|| element.out_properties.clone()),
            }),
        );
        self.transport.publish(&self.topic, msg.to_json()?).await
    }
}
