use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::Result;
use crate::storage::InstanceStore;
use crate::transport::Transport;
use crate::types::{
    ElementTypeId, Message, MessageBody, MessageId, Participant, ParticipantAck,
    ParticipantHealth, ParticipantId, ParticipantStatus,
};

/// Tracks the participant fleet: registration, heartbeat bookkeeping and
/// the liveness sweep feeding the supervisor.
pub struct ParticipantRegistry {
    store: Arc<dyn InstanceStore>,
    transport: Arc<dyn Transport>,
    config: Config,
}

impl ParticipantRegistry {
    pub fn new(store: Arc<dyn InstanceStore>, transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    pub async fn handle_register(
        &self,
        sender: ParticipantId,
        supported_element_types: Vec<ElementTypeId>,
        message_id: MessageId,
    ) -> Result<()> {
        let participant = match self.store.find_participant(sender).await? {
            Some(mut existing) => {
                existing.supported_element_types = supported_element_types;
                existing.health = ParticipantHealth::Healthy;
                existing.last_heartbeat = Utc::now();
                existing
            }
            None => Participant::new(sender, supported_element_types),
        };
        self.store.save_participant(&participant).await?;

        self.send(
            sender,
            MessageBody::ParticipantRegisterAck(ParticipantAck {
                response_to: message_id,
            }),
        )
        .await?;
        log::info!(
            "participant {} registered ({} element types)",
            sender,
            participant.supported_element_types.len()
        );
        Ok(())
    }

    pub async fn handle_deregister(
        &self,
        sender: ParticipantId,
        message_id: MessageId,
    ) -> Result<()> {
        self.store.delete_participant(sender).await?;
        self.send(
            sender,
            MessageBody::ParticipantDeregisterAck(ParticipantAck {
                response_to: message_id,
            }),
        )
        .await?;
        log::info!("participant {} deregistered", sender);
        Ok(())
    }

    pub async fn handle_status(&self, sender: ParticipantId, status: ParticipantStatus) -> Result<()> {
        let mut participant = match self.store.find_participant(sender).await? {
            Some(existing) => existing,
            None => {
                // a heartbeat can outlive a runtime restart; re-adopt the sender
                log::info!("participant {} discovered via status", sender);
                Participant::new(sender, Vec::new())
            }
        };

        participant.state = status.state;
        participant.health = ParticipantHealth::Healthy;
        participant.last_heartbeat = Utc::now();
        self.store.save_participant(&participant).await?;

        log::debug!(
            "heartbeat from {} ({}, {} instances)",
            sender,
            status.state.as_str(),
            status.compositions.len()
        );
        Ok(())
    }

    /// Liveness sweep. Half the status window of silence demotes a
    /// participant to NOT_HEALTHY and solicits an immediate heartbeat; the
    /// full window demotes it to OFF_LINE. Returns the off-line set.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<ParticipantId>> {
        let mut off_line = Vec::new();

        for mut participant in self.store.list_participants().await? {
            let silence_ms = (now - participant.last_heartbeat).num_milliseconds().max(0) as u64;

            if silence_ms >= self.config.max_status_wait_ms {
                if participant.health != ParticipantHealth::OffLine {
                    participant.health = ParticipantHealth::OffLine;
                    self.store.save_participant(&participant).await?;
                    log::warn!(
                        "participant {} off-line after {}ms of silence",
                        participant.participant_id,
                        silence_ms
                    );
                }
                off_line.push(participant.participant_id);
            } else if silence_ms >= self.config.max_status_wait_ms / 2
                && participant.health != ParticipantHealth::NotHealthy
            {
                participant.health = ParticipantHealth::NotHealthy;
                self.store.save_participant(&participant).await?;
                self.send(participant.participant_id, MessageBody::ParticipantStatusReq)
                    .await?;
                log::warn!(
                    "participant {} silent for {}ms, status requested",
                    participant.participant_id,
                    silence_ms
                );
            }
        }

        Ok(off_line)
    }

    async fn send(&self, target: ParticipantId, body: MessageBody) -> Result<()> {
        let msg = Message::new(Some(target), body);
        self.transport
            .publish(&self.config.topic, msg.to_json()?)
            .await
    }
}
