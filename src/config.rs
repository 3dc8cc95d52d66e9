use serde::{Deserialize, Serialize};

use crate::types::{ElementTypeId, ParticipantId};

/// Runtime-side tuning. All windows are wall-clock milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared pub/sub channel for both directions of the protocol.
    pub topic: String,
    /// Cadence at which participants publish ParticipantStatus.
    pub heart_beat_ms: u64,
    /// Silence window after which a participant is declared off-line.
    pub max_status_wait_ms: u64,
    /// Per-attempt window for a dispatched command to be acknowledged.
    pub max_operation_wait_ms: u64,
    /// Re-issues of an expired command before the final verdict.
    pub operation_retry_limit: u32,
    /// Cadence of the supervision scan.
    pub supervision_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic: "acruntime-participant".to_string(),
            heart_beat_ms: 20_000,
            max_status_wait_ms: 150_000,
            max_operation_wait_ms: 200_000,
            operation_retry_limit: 2,
            supervision_interval_ms: 5_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            topic: std::env::var("ENSEMBLE_TOPIC").unwrap_or(defaults.topic),
            heart_beat_ms: env_u64("ENSEMBLE_HEARTBEAT_MS", defaults.heart_beat_ms),
            max_status_wait_ms: env_u64("ENSEMBLE_MAX_STATUS_WAIT_MS", defaults.max_status_wait_ms),
            max_operation_wait_ms: env_u64(
                "ENSEMBLE_MAX_OPERATION_WAIT_MS",
                defaults.max_operation_wait_ms,
            ),
            operation_retry_limit: env_u64(
                "ENSEMBLE_OPERATION_RETRY_LIMIT",
                defaults.operation_retry_limit as u64,
            ) as u32,
            supervision_interval_ms: env_u64(
                "ENSEMBLE_SUPERVISION_INTERVAL_MS",
                defaults.supervision_interval_ms,
            ),
        }
    }
}

/// Participant-side tuning, one per intermediary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediaryConfig {
    pub participant_id: ParticipantId,
    pub supported_element_types: Vec<ElementTypeId>,
    pub topic: String,
    pub heart_beat_ms: u64,
}

impl IntermediaryConfig {
    pub fn new(participant_id: ParticipantId, supported_element_types: Vec<ElementTypeId>) -> Self {
        let defaults = Config::default();
        Self {
            participant_id,
            supported_element_types,
            topic: defaults.topic,
            heart_beat_ms: defaults.heart_beat_ms,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
