use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Transport;
use crate::error::Result;

/// Process-local fan-out bus: every subscriber of a topic receives every
/// payload published to it, in publish order. Closed subscribers are pruned
/// on the next publish.
pub struct InMemoryBus {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut topics = self.topics.write().unwrap();
        if let Some(senders) = topics.get_mut(topic) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
        } else {
            log::debug!("publish to {} with no subscribers", topic);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
