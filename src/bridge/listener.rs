//! Message listener
//!
//! Owns the event stream of one broker connection and feeds every inbound
//! message to the routing table that is current at delivery time. Exactly
//! one listener is attached at any time; a reconnect detaches the old one
//! before a new connection gets its own.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::RoutingTable;
use crate::mqtt::{BrokerEvent, BrokerEvents};

#[derive(Debug)]
pub struct MessageListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MessageListener {
    pub fn attach(events: BrokerEvents, table: watch::Receiver<Arc<RoutingTable>>) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(events, table, cancel.clone()));
        debug!("Message listener attached");
        Self { cancel, task }
    }

    /// Stops listening. Once this returns no further message is dispatched
    /// from the old event stream.
    pub async fn detach(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Message listener ended abnormally: {}", e);
        }
        debug!("Message listener detached");
    }
}

async fn listen(
    mut events: BrokerEvents,
    table: watch::Receiver<Arc<RoutingTable>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Some(BrokerEvent::Message(message)) => {
                debug!("< {}", message);
                let routes = table.borrow().clone();
                routes.dispatch(&message.topic, message.payload);
            }
            Some(BrokerEvent::Connected) => debug!("Broker connection established"),
            Some(BrokerEvent::Offline) => warn!("Broker offline, waiting for reconnect"),
            None => {
                info!("Broker event stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{ModuleHandle, ModuleInit};
    use crate::mqtt::{BrokerConnector, LoopbackBroker, MqttConfig};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn dispatches_until_detached() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ModuleHandle::new(
            "m".into(),
            "home/pc/m".into(),
            toml::Table::new(),
            ModuleInit::new().subscribe("home/pc/m/set", move |_, payload| {
                let _ = tx.send(payload);
                async { Ok(()) }
            }),
        ));
        let (_table_tx, table_rx) = watch::channel(Arc::new(RoutingTable::build(&[handle])));

        let loopback = LoopbackBroker::new();
        let (client, events) = loopback.connect(&MqttConfig::default()).await.unwrap();
        client.subscribe(&["home/pc/m/set".to_string()]).await.unwrap();

        let listener = MessageListener::attach(events, table_rx);
        loopback.inject("home/pc/m/set", "1");
        assert_eq!(rx.recv().await.unwrap(), b"1".to_vec());

        listener.detach().await;
        loopback.inject("home/pc/m/set", "2");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ends_when_stream_closes() {
        let (tx, rx) = mpsc::channel(1);
        let (_table_tx, table_rx) = watch::channel(Arc::new(RoutingTable::empty()));
        let listener = MessageListener::attach(rx, table_rx);
        drop(tx);
        listener.detach().await;
    }
}
