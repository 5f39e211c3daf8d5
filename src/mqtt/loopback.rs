//! In-process broker.
//!
//! Delivers every publish to each connected client that subscribed to the
//! exact topic. Used by the test-suite and for running the bridge without a
//! network broker.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    BrokerClient, BrokerConnector, BrokerError, BrokerEvent, BrokerEvents, ConnectionState,
    MqttConfig, MqttMessage, EVENT_CHANNEL_CAPACITY,
};

#[derive(Default)]
struct LoopbackState {
    next_id: u64,
    peers: HashMap<u64, Peer>,
    published: Vec<MqttMessage>,
    connects: usize,
    refuse_connects: usize,
}

struct Peer {
    topics: HashSet<String>,
    events: mpsc::Sender<BrokerEvent>,
}

#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        // A poisoned lock only means a test thread panicked mid-update
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes as an outside device would, without a client of our own
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        self.deliver(MqttMessage::from_topic(topic, payload))
    }

    fn deliver(&self, message: MqttMessage) -> usize {
        let mut state = self.lock();
        state.published.push(message.clone());

        let mut delivered = 0;
        for (id, peer) in state.peers.iter() {
            if !peer.topics.contains(&message.topic) {
                continue;
            }
            match peer.events.try_send(BrokerEvent::Message(message.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Loopback peer {} dropped message: {}", id, e),
            }
        }
        delivered
    }

    /// Every message published so far, in order
    pub fn published(&self) -> Vec<MqttMessage> {
        self.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<MqttMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn connected_clients(&self) -> usize {
        self.lock().peers.len()
    }

    /// Number of connected clients subscribed to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .peers
            .values()
            .filter(|p| p.topics.contains(topic))
            .count()
    }

    /// Makes the next `count` connection attempts fail
    pub fn refuse_connects(&self, count: usize) {
        self.lock().refuse_connects = count;
    }
}

#[async_trait]
impl BrokerConnector for LoopbackBroker {
    async fn connect(
        &self,
        _config: &MqttConfig,
    ) -> Result<(Arc<dyn BrokerClient>, BrokerEvents), BrokerError> {
        let mut state = self.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            warn!("Loopback broker refused connection");
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Fresh channel, cannot be full
        let _ = events_tx.try_send(BrokerEvent::Connected);

        let id = state.next_id;
        state.next_id += 1;
        state.connects += 1;
        state.peers.insert(
            id,
            Peer {
                topics: HashSet::new(),
                events: events_tx,
            },
        );
        drop(state);

        let client = LoopbackClient {
            id,
            broker: self.clone(),
        };
        Ok((Arc::new(client), events_rx))
    }
}

pub struct LoopbackClient {
    id: u64,
    broker: LoopbackBroker,
}

#[async_trait]
impl BrokerClient for LoopbackClient {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let peer = state
            .peers
            .get_mut(&self.id)
            .ok_or(BrokerError::NotConnected)?;
        peer.topics.extend(topics.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let peer = state
            .peers
            .get_mut(&self.id)
            .ok_or(BrokerError::NotConnected)?;
        for topic in topics {
            peer.topics.remove(topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.broker.lock().peers.contains_key(&self.id) {
            return Err(BrokerError::NotConnected);
        }
        self.broker.deliver(MqttMessage::from_topic(topic, payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.broker.lock().peers.remove(&self.id);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.broker.lock().peers.contains_key(&self.id) {
            ConnectionState::Connected
        } else {
            ConnectionState::Closed
        }
    }
}
