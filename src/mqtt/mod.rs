//! # MQTT Integration Module
//!
//! Broker access for the bridge. The rest of the crate never talks to a
//! concrete MQTT library; it goes through two traits:
//!
//! - [`BrokerConnector`] creates a connection and hands back the client plus
//!   its event stream (`connect` / `offline` / `message`).
//! - [`BrokerClient`] is the live connection: subscribe, publish, disconnect.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings ([mqtt] table)
//! ├── message_manager.rs  - Inbound message representation
//! ├── mqtt_handler.rs     - rumqttc-backed connector and client
//! └── loopback.rs         - In-process broker for tests and offline runs
//! ```
//!
//! ## Reconnects
//!
//! A connection is replaced wholesale on reconnect. Modules never hold a
//! client directly; they publish through [`SharedBroker`], which always
//! points at the connection that is currently installed.

pub mod config;
pub mod loopback;
pub mod message_manager;
pub mod mqtt_handler;

pub use config::MqttConfig;
pub use loopback::LoopbackBroker;
pub use message_manager::MqttMessage;
pub use mqtt_handler::{ConnectionState, RumqttConnector};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Capacity of the per-connection event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscribe error: {0}")]
    Subscribe(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Disconnect error: {0}")]
    Disconnect(String),

    #[error("Not connected to a broker")]
    NotConnected,
}

/// Events emitted by a broker connection
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Connected,
    Offline,
    Message(MqttMessage),
}

pub type BrokerEvents = mpsc::Receiver<BrokerEvent>;

/// A live broker connection
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Closes the connection. Calling it on a closed connection is a no-op.
    async fn disconnect(&self) -> Result<(), BrokerError>;

    fn connection_state(&self) -> ConnectionState;
}

/// Factory for broker connections
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        config: &MqttConfig,
    ) -> Result<(Arc<dyn BrokerClient>, BrokerEvents), BrokerError>;
}

/// Process-wide slot for the current broker connection.
///
/// Only the bridge replaces the connection; everybody else reads it when
/// publishing.
#[derive(Clone, Default)]
pub struct SharedBroker {
    current: Arc<RwLock<Option<Arc<dyn BrokerClient>>>>,
}

impl fmt::Debug for SharedBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBroker").finish_non_exhaustive()
    }
}

impl SharedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new connection and returns the previous one
    pub async fn replace(
        &self,
        client: Option<Arc<dyn BrokerClient>>,
    ) -> Option<Arc<dyn BrokerClient>> {
        let mut guard = self.current.write().await;
        std::mem::replace(&mut *guard, client)
    }

    pub async fn current(&self) -> Option<Arc<dyn BrokerClient>> {
        self.current.read().await.clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match self.current().await {
            Some(client) => client.connection_state(),
            None => ConnectionState::Disconnected,
        }
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), BrokerError> {
        let client = self.current().await.ok_or(BrokerError::NotConnected)?;
        let payload = payload.into();
        debug!("> {}: {}", topic, String::from_utf8_lossy(&payload));
        client.publish(topic, payload).await
    }
}
