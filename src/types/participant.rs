use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ElementTypeId, ParticipantHealth, ParticipantId, ParticipantState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub supported_element_types: Vec<ElementTypeId>,
    pub state: ParticipantState,
    pub health: ParticipantHealth,
    pub last_heartbeat: DateTime<Utc>,
}

impl Participant {
    pub fn new(participant_id: ParticipantId, supported_element_types: Vec<ElementTypeId>) -> Self {
        Self {
            participant_id,
            supported_element_types,
            state: ParticipantState::Unknown,
            health: ParticipantHealth::Healthy,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn supports(&self, element_type: &str) -> bool {
        self.supported_element_types.iter().any(|t| t == element_type)
    }
}
