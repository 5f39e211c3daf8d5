//! Newline-delimited JSON commands on stdin
//!
//! ```text
//! {"action": "reconnect"}
//! {"action": "toggle", "module": "heartbeat"}
//! {"action": "list"}
//! {"action": "reload"}
//! {"action": "quit"}
//! ```
//!
//! Anything that is not a JSON object with an `action` is ignored, so the
//! bridge can share stdin with a parent process that writes other things.

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::{BridgeClient, BridgeError};

#[derive(Debug, Deserialize)]
struct StdinCommand {
    action: Option<String>,
    module: Option<String>,
}

/// Reads commands until EOF or until `quit` is cancelled
pub async fn run<R>(reader: R, client: BridgeClient, quit: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = quit.cancelled() => return,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("stdin: read failed: {}", e);
                break;
            }
        };

        let Ok(command) = serde_json::from_str::<StdinCommand>(&line) else {
            continue;
        };
        let Some(action) = command.action.filter(|a| !a.is_empty()) else {
            continue;
        };

        info!("stdin: {}", action);
        if let Err(e) = execute(&action, command.module, &client, &quit).await {
            error!("stdin: error in \"{}\": {}", action, e);
        }
    }

    info!("stdin closed");
}

async fn execute(
    action: &str,
    module: Option<String>,
    client: &BridgeClient,
    quit: &CancellationToken,
) -> Result<(), BridgeError> {
    match action {
        "reconnect" => client.reconnect().await,
        "toggle" => {
            let name = module.unwrap_or_default();
            let status = client.toggle_module(&name).await?;
            let state = if status.enabled { "enabled" } else { "disabled" };
            info!("stdin: {} is now {}", status.name, state);
            Ok(())
        }
        "list" => {
            let modules = client.list_modules().await?;
            match serde_json::to_string(&modules) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("stdin: cannot encode module list: {}", e),
            }
            Ok(())
        }
        "reload" => client.reload().await,
        "quit" => {
            quit.cancel();
            Ok(())
        }
        other => {
            warn!("stdin: unknown action \"{}\"", other);
            Ok(())
        }
    }
}

/// Reads the process' stdin in a background task
pub fn spawn(client: BridgeClient, quit: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run(BufReader::new(tokio::io::stdin()), client, quit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, BridgeWorker};
    use crate::config::Config;
    use crate::modules::ModuleRegistry;
    use crate::mqtt::LoopbackBroker;
    use std::sync::Arc;

    async fn client(loopback: &LoopbackBroker) -> BridgeClient {
        let config = Config::from_toml_str("[modules.heartbeat]").unwrap();
        let mut bridge = Bridge::new(config, Arc::new(loopback.clone()), ModuleRegistry::builtin());
        bridge.start().await.unwrap();
        BridgeWorker::spawn(bridge).0
    }

    #[tokio::test]
    async fn runs_known_actions_and_skips_noise() {
        let loopback = LoopbackBroker::new();
        let client = client(&loopback).await;
        let quit = CancellationToken::new();

        let input = concat!(
            "hello\n",
            "{\"no_action\": true}\n",
            "{\"action\": \"dance\"}\n",
            "{\"action\": \"toggle\", \"module\": \"missing\"}\n",
            "{\"action\": \"toggle\", \"module\": \"heartbeat\"}\n",
            "{\"action\": \"reconnect\"}\n",
        );
        run(input.as_bytes(), client.clone(), quit.clone()).await;

        let modules = client.list_modules().await.unwrap();
        assert!(!modules[0].enabled);
        assert_eq!(loopback.connect_count(), 2);
        assert!(!quit.is_cancelled());
    }

    #[tokio::test]
    async fn quit_cancels_token() {
        let loopback = LoopbackBroker::new();
        let client = client(&loopback).await;
        let quit = CancellationToken::new();

        run(&b"{\"action\": \"quit\"}\n{\"action\": \"reconnect\"}\n"[..], client, quit.clone()).await;

        assert!(quit.is_cancelled());
        assert_eq!(loopback.connect_count(), 1);
    }
}
