//! rumqttc-backed broker connection.
//!
//! `connect` returns as soon as the client and its event loop exist, the
//! same way the network handshake is left to the first poll. The event loop
//! runs in its own tokio task and translates rumqttc notifications into
//! [`BrokerEvent`]s.
//!
//! ```text
//! EventLoop::poll ──► ConnAck  ──► BrokerEvent::Connected (+ resubscribe)
//!                 ──► Publish  ──► BrokerEvent::Message
//!                 ──► Err(_)   ──► BrokerEvent::Offline, back off, poll again
//!                 ──► Outgoing Disconnect ──► task ends
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    BrokerClient, BrokerConnector, BrokerError, BrokerEvent, BrokerEvents, MqttConfig,
    MqttMessage, EVENT_CHANNEL_CAPACITY,
};

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Connector producing rumqttc connections
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn options(config: &MqttConfig) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(
            config.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ));
        if config.has_credentials() {
            mqtt_options.set_credentials(config.user.clone(), config.password.clone());
        }
        mqtt_options
    }
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(
        &self,
        config: &MqttConfig,
    ) -> Result<(Arc<dyn BrokerClient>, BrokerEvents), BrokerError> {
        info!("Connecting to MQTT {}:{}...", config.host, config.port);

        let (client, eventloop) = AsyncClient::new(Self::options(config), REQUEST_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let subscribed = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            config.host.clone(),
            subscribed.clone(),
            event_tx,
            state_tx,
            cancel.clone(),
        ));

        let client = RumqttClient {
            client,
            subscribed,
            state: state_rx,
            cancel,
            task: Mutex::new(Some(task)),
        };
        Ok((Arc::new(client), event_rx))
    }
}

/// Live rumqttc connection
pub struct RumqttClient {
    client: AsyncClient,
    /// Topics to restore after the event loop reconnects on its own
    subscribed: Arc<Mutex<Vec<String>>>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttClient {
    fn remember(&self, topics: &[String], add: bool) {
        match self.subscribed.lock() {
            Ok(mut guard) => {
                if add {
                    for topic in topics {
                        if !guard.contains(topic) {
                            guard.push(topic.clone());
                        }
                    }
                } else {
                    guard.retain(|t| !topics.contains(t));
                }
            }
            Err(e) => warn!("Unable to record subscriptions: {}", e),
        }
    }
}

#[async_trait]
impl BrokerClient for RumqttClient {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        self.remember(topics, true);
        subscribe_all(&self.client, topics).await
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        self.remember(topics, false);
        for topic in topics {
            self.client
                .unsubscribe(topic.clone())
                .await
                .map_err(|e| BrokerError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(e) => {
                error!("Connection task lock poisoned: {}", e);
                None
            }
        };
        let Some(mut task) = task else {
            debug!("MQTT connection already closed");
            return Ok(());
        };

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }

        // The event loop ends by itself once the Disconnect packet went out
        if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
            debug!("MQTT event loop still busy, cancelling");
            self.cancel.cancel();
            if let Err(e) = task.await {
                return Err(BrokerError::Disconnect(e.to_string()));
            }
        }
        info!("MQTT connection closed");
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

async fn subscribe_all(client: &AsyncClient, topics: &[String]) -> Result<(), BrokerError> {
    if topics.is_empty() {
        return Ok(());
    }
    let filters = topics
        .iter()
        .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce));
    client
        .subscribe_many(filters)
        .await
        .map_err(|e| BrokerError::Subscribe(e.to_string()))
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    host: String,
    subscribed: Arc<Mutex<Vec<String>>>,
    events: mpsc::Sender<BrokerEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    debug!("Starting MQTT event loop for {}", host);
    let mut connected_once = false;

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            notification = eventloop.poll() => notification,
        };

        let event = match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected to {}", host);
                let _ = state.send(ConnectionState::Connected);
                if connected_once {
                    let topics = subscribed.lock().map(|t| t.clone()).unwrap_or_default();
                    if let Err(e) = subscribe_all(&client, &topics).await {
                        error!("Failed to restore subscriptions: {}", e);
                    }
                }
                connected_once = true;
                BrokerEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Message(
                MqttMessage::from_topic(publish.topic.clone(), publish.payload.to_vec()),
            ),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent to {}", host);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("MQTT offline: {}", e);
                let _ = state.send(ConnectionState::Reconnecting);
                if events.send(BrokerEvent::Offline).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                }
            }
        };

        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping MQTT event loop");
            break;
        }
    }

    let _ = state.send(ConnectionState::Closed);
    debug!("MQTT event loop for {} terminated", host);
}
