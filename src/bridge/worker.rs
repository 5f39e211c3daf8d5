//! Command channel into a running bridge.
//!
//! A single worker task owns the [`Bridge`] and executes commands one after
//! another; UIs and other controllers hold a cloneable [`BridgeClient`].

use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Bridge, BridgeError};
use crate::modules::ModuleStatus;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action.await).is_err() {
            error!("Failed to send bridge response");
        }
    };
}

#[derive(Debug)]
pub enum BridgeCommand {
    ToggleModule {
        name: String,
        response_tx: oneshot::Sender<Result<ModuleStatus, BridgeError>>,
    },
    Reconnect {
        response_tx: oneshot::Sender<Result<(), BridgeError>>,
    },
    ListModules {
        response_tx: oneshot::Sender<Vec<ModuleStatus>>,
    },
    Reload {
        response_tx: oneshot::Sender<Result<(), BridgeError>>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

pub struct BridgeWorker;

impl BridgeWorker {
    /// Moves `bridge` into a worker task. The task hands the bridge back
    /// after `shutdown`, or after every client was dropped.
    pub fn spawn(bridge: Bridge) -> (BridgeClient, JoinHandle<Bridge>) {
        let (tx, rx) = channel::<BridgeCommand>(COMMAND_CHANNEL_CAPACITY);
        let handle = tokio::spawn(run(bridge, rx));
        (BridgeClient { tx }, handle)
    }
}

async fn run(mut bridge: Bridge, mut rx: Receiver<BridgeCommand>) -> Bridge {
    while let Some(command) = rx.recv().await {
        debug!("Bridge command: {:?}", command);
        match command {
            BridgeCommand::ToggleModule { name, response_tx } => {
                handle_action!(bridge.toggle_module(&name), response_tx);
            }
            BridgeCommand::Reconnect { response_tx } => {
                handle_action!(bridge.reconnect(), response_tx);
            }
            BridgeCommand::ListModules { response_tx } => {
                if response_tx.send(bridge.list_modules()).is_err() {
                    error!("Failed to send bridge response");
                }
            }
            BridgeCommand::Reload { response_tx } => {
                handle_action!(bridge.reload(), response_tx);
            }
            BridgeCommand::Shutdown { response_tx } => {
                bridge.shutdown().await;
                let _ = response_tx.send(());
                break;
            }
        }
    }

    if !bridge.is_stopped() {
        info!("Bridge command channel closed");
        bridge.shutdown().await;
    }
    bridge
}

#[derive(Debug, Clone)]
pub struct BridgeClient {
    tx: Sender<BridgeCommand>,
}

impl BridgeClient {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> BridgeCommand,
    ) -> Result<T, BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(command(response_tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        response_rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    pub async fn toggle_module(&self, name: &str) -> Result<ModuleStatus, BridgeError> {
        let name = name.to_string();
        self.request(|response_tx| BridgeCommand::ToggleModule { name, response_tx })
            .await?
    }

    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        self.request(|response_tx| BridgeCommand::Reconnect { response_tx })
            .await?
    }

    pub async fn list_modules(&self) -> Result<Vec<ModuleStatus>, BridgeError> {
        self.request(|response_tx| BridgeCommand::ListModules { response_tx })
            .await
    }

    pub async fn reload(&self) -> Result<(), BridgeError> {
        self.request(|response_tx| BridgeCommand::Reload { response_tx })
            .await?
    }

    /// Shuts the bridge down; succeeds as well when it already is
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        match self
            .request(|response_tx| BridgeCommand::Shutdown { response_tx })
            .await
        {
            Ok(()) | Err(BridgeError::ChannelClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::modules::{ModuleRegistry, ModuleState};
    use crate::mqtt::LoopbackBroker;
    use std::sync::Arc;

    async fn started(loopback: &LoopbackBroker) -> Bridge {
        let config = Config::from_toml_str("[modules.exec]\n[modules.heartbeat]").unwrap();
        let mut bridge = Bridge::new(config, Arc::new(loopback.clone()), ModuleRegistry::builtin());
        bridge.start().await.unwrap();
        bridge
    }

    #[tokio::test]
    async fn commands_run_against_owned_bridge() {
        let loopback = LoopbackBroker::new();
        let (client, handle) = BridgeWorker::spawn(started(&loopback).await);

        let modules = client.list_modules().await.unwrap();
        assert_eq!(modules.len(), 2);
        assert!(!modules[0].can_toggle);
        assert!(modules[1].can_toggle);

        let status = client.toggle_module("heartbeat").await.unwrap();
        assert_eq!(status.state, ModuleState::Disabled);
        assert!(matches!(
            client.toggle_module("nope").await,
            Err(BridgeError::UnknownModule(_))
        ));

        client.reconnect().await.unwrap();
        assert_eq!(loopback.connect_count(), 2);
        assert_eq!(loopback.connected_clients(), 1);

        client.shutdown().await.unwrap();
        client.shutdown().await.unwrap();
        let bridge = handle.await.unwrap();
        assert!(bridge.is_stopped());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn dropping_all_clients_shuts_down() {
        let loopback = LoopbackBroker::new();
        let (client, handle) = BridgeWorker::spawn(started(&loopback).await);
        drop(client);

        let bridge = handle.await.unwrap();
        assert!(bridge.is_stopped());
        assert_eq!(loopback.connected_clients(), 0);
    }
}
