//! # Bridge
//!
//! Orchestrator owning the broker connection, the loaded module handles and
//! the message listener. All lifecycle changes go through its methods:
//!
//! ```text
//!            start()
//!   Bridge ──────────► connect ─► load modules ─► routing table ─► subscribe ─► listener
//!     │
//!     ├── toggle_module(name)   flag flip + on_start / on_stop
//!     ├── reconnect()           detach ─► disconnect ─► connect ─► subscribe ─► attach
//!     ├── reload()              stop handles ─► load modules ─► resubscribe
//!     └── shutdown()            on_stop all ─► detach ─► disconnect (idempotent)
//! ```
//!
//! The listener reads the routing table through a `watch` channel, so
//! replacing the table never requires touching the listener.

pub mod error;
pub mod listener;
pub mod router;
pub mod worker;

pub use error::BridgeError;
pub use listener::MessageListener;
pub use router::{DispatchOutcome, Route, RoutingTable};
pub use worker::{BridgeClient, BridgeCommand, BridgeWorker};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::modules::{ModuleHandle, ModuleLoader, ModuleRegistry, ModuleStatus};
use crate::mqtt::{BrokerConnector, BrokerError, BrokerEvents, ConnectionState, SharedBroker};

pub struct Bridge {
    config: Config,
    config_path: Option<PathBuf>,
    connector: Arc<dyn BrokerConnector>,
    loader: ModuleLoader,
    broker: SharedBroker,
    modules: Vec<Arc<ModuleHandle>>,
    table_tx: watch::Sender<Arc<RoutingTable>>,
    listener: Option<MessageListener>,
    /// Topics issued on the current connection
    subscribed: Vec<String>,
    started: bool,
    stopped: bool,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config_path", &self.config_path)
            .field("modules", &self.modules)
            .field("subscribed", &self.subscribed)
            .field("listening", &self.listener.is_some())
            .field("started", &self.started)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Bridge {
    pub fn new(config: Config, connector: Arc<dyn BrokerConnector>, registry: ModuleRegistry) -> Self {
        let loader = ModuleLoader::new(registry, config.mqtt.clone(), config.debug);
        let (table_tx, _) = watch::channel(Arc::new(RoutingTable::empty()));

        Self {
            config,
            config_path: None,
            connector,
            loader,
            broker: SharedBroker::new(),
            modules: Vec::new(),
            table_tx,
            listener: None,
            subscribed: Vec::new(),
            started: false,
            stopped: false,
        }
    }

    /// Remembers where the config came from so `reload` can read it again
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Handle modules publish through; survives reconnects
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.broker.connection_state().await
    }

    /// Loaded handles in load order
    pub fn modules(&self) -> &[Arc<ModuleHandle>] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&Arc<ModuleHandle>> {
        self.modules.iter().find(|handle| handle.name() == name)
    }

    pub fn list_modules(&self) -> Vec<ModuleStatus> {
        self.modules.iter().map(|handle| handle.status()).collect()
    }

    pub fn routing_table(&self) -> Arc<RoutingTable> {
        self.table_tx.borrow().clone()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Connects, loads every enabled module and starts dispatching.
    ///
    /// A failed connection is logged and the bridge keeps running without
    /// subscriptions until `reconnect` succeeds.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        if self.stopped {
            return Err(BridgeError::ShutDown);
        }
        if self.started {
            warn!("Bridge already started");
            return Ok(());
        }
        info!("mqttbridge started");

        let events = match self.connect().await {
            Ok(events) => Some(events),
            Err(e) => {
                error!("MQTT connection failed: {}", e);
                None
            }
        };

        let specs = self.config.enabled_modules();
        self.modules = self.loader.load(&specs, &self.broker).await;
        self.install_routes();

        if let Err(e) = self.subscribe_routes().await {
            error!("Failed to subscribe: {}", e);
        }
        if let Some(events) = events {
            self.listener = Some(MessageListener::attach(events, self.table_tx.subscribe()));
        }

        self.started = true;
        Ok(())
    }

    /// Flips the module's `enabled` flag and runs the matching hook
    pub async fn toggle_module(&mut self, name: &str) -> Result<ModuleStatus, BridgeError> {
        if self.stopped {
            return Err(BridgeError::ShutDown);
        }
        let handle = self
            .module(name)
            .ok_or_else(|| BridgeError::UnknownModule(name.to_string()))?;

        let enabled = handle.toggle()?;
        info!("Module {} {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(handle.status())
    }

    /// Replaces the broker connection without restarting modules.
    ///
    /// The old listener is gone before the new connection exists, and the new
    /// one is attached only after the full topic set was subscribed, so every
    /// message is dispatched at most once.
    pub async fn reconnect(&mut self) -> Result<(), BridgeError> {
        if self.stopped {
            return Err(BridgeError::ShutDown);
        }
        info!("Reconnecting to MQTT broker");

        if let Some(listener) = self.listener.take() {
            listener.detach().await;
        }
        if let Some(old) = self.broker.replace(None).await {
            if let Err(e) = old.disconnect().await {
                warn!("Failed to close previous connection: {}", e);
            }
        }
        self.subscribed.clear();

        let events = self.connect().await?;
        self.install_routes();
        let subscribed = self.subscribe_routes().await;
        self.listener = Some(MessageListener::attach(events, self.table_tx.subscribe()));
        subscribed?;

        info!("MQTT reconnected");
        Ok(())
    }

    /// Reads the config again and rebuilds all modules on the current
    /// connection. Broker settings take effect on the next `reconnect`.
    pub async fn reload(&mut self) -> Result<(), BridgeError> {
        if self.stopped {
            return Err(BridgeError::ShutDown);
        }
        if !self.started {
            return Err(BridgeError::NotStarted);
        }

        if let Some(path) = &self.config_path {
            let config = Config::load(path).await?;
            self.loader.reconfigure(config.mqtt.clone(), config.debug);
            self.config = config;
        }
        info!("Reloading modules");

        self.stop_modules();
        let specs = self.config.enabled_modules();
        self.modules = self.loader.load(&specs, &self.broker).await;
        let table = self.install_routes();

        let removed: Vec<String> = self
            .subscribed
            .iter()
            .filter(|topic| table.route(topic).is_none())
            .cloned()
            .collect();
        if !removed.is_empty() {
            if let Some(client) = self.broker.current().await {
                debug!("Unsubscribe from topics: {:?}", removed);
                client.unsubscribe(&removed).await?;
            }
        }
        self.subscribe_routes().await?;
        Ok(())
    }

    /// Stops every module, detaches the listener and closes the connection.
    /// Safe to call at any point, any number of times.
    ///
    /// Modules already disabled through `toggle_module` ran `on_stop` at that
    /// point and are not stopped a second time. The handles are released
    /// afterwards, which ends any task they keep alive.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            debug!("Bridge already shut down");
            return;
        }
        self.stopped = true;
        info!("Shutting down mqttbridge");

        self.stop_modules();

        if let Some(listener) = self.listener.take() {
            listener.detach().await;
        }
        if let Some(client) = self.broker.replace(None).await {
            if let Err(e) = client.disconnect().await {
                warn!("Failed to close MQTT connection: {}", e);
            }
        }
        self.subscribed.clear();
        self.table_tx.send_replace(Arc::new(RoutingTable::empty()));
        self.modules.clear();

        info!("mqttbridge stopped");
    }

    async fn connect(&self) -> Result<BrokerEvents, BrokerError> {
        let (client, events) = self.connector.connect(&self.config.mqtt).await?;
        if let Some(stale) = self.broker.replace(Some(client)).await {
            if let Err(e) = stale.disconnect().await {
                warn!("Failed to close stale connection: {}", e);
            }
        }
        Ok(events)
    }

    fn install_routes(&self) -> Arc<RoutingTable> {
        let table = Arc::new(RoutingTable::build(&self.modules));
        debug!("Routing table rebuilt with {} topic(s)", table.len());
        self.table_tx.send_replace(table.clone());
        table
    }

    /// Issues the full topic set once on the current connection
    async fn subscribe_routes(&mut self) -> Result<(), BrokerError> {
        let Some(client) = self.broker.current().await else {
            debug!("No broker connection, subscriptions deferred");
            return Ok(());
        };

        let topics = self.routing_table().topics().to_vec();
        if topics.is_empty() {
            info!("No topics to subscribe to");
        } else {
            info!("Subscribe to topics:\n- {}", topics.join("\n- "));
            client.subscribe(&topics).await?;
        }
        self.subscribed = topics;
        Ok(())
    }

    fn stop_modules(&self) {
        for handle in &self.modules {
            match handle.stop() {
                Some(Ok(())) => debug!("Module {} stopped", handle.name()),
                Some(Err(e)) => error!("Failed to stop module {}: {}", handle.name(), e),
                None => {}
            }
        }
    }
}
