//! User defined topic commands
//!
//! ```toml
//! [modules.commands]
//! commands = [
//!   { topic = "home/pc/audio/volume/set", publish = [{ topic = "tts", payload = "volume" }] },
//!   { topic = "home/pc/lock", exec = "loginctl lock-session" },
//! ]
//! ```
//!
//! Each entry subscribes its `topic`. Declared after another module, an entry
//! takes over that module's topic.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;

use super::{ModuleContext, ModuleError, ModuleInit};

#[derive(Debug, Clone, Default, Deserialize)]
struct CommandsOptions {
    #[serde(default)]
    commands: Vec<Command>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub topic: String,
    #[serde(default)]
    pub publish: Vec<PublishAction>,
    #[serde(default)]
    pub exec: Option<String>,
    #[serde(default)]
    pub success_tts: Option<String>,
    #[serde(default)]
    pub error_tts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishAction {
    pub topic: String,
    /// Inbound payload is forwarded when absent
    #[serde(default)]
    pub payload: Option<String>,
}

pub fn init(ctx: ModuleContext) -> BoxFuture<'static, Result<ModuleInit, ModuleError>> {
    async move {
        let options: CommandsOptions = ctx.options_as()?;
        let exec_topic = ctx.global_topic("exec/cmd");
        let mut init = ModuleInit::new();

        for command in options.commands {
            if command.topic.is_empty() {
                return Err(ModuleError::InvalidOption {
                    key: "commands.topic".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            ctx.logger.debug(format!("command on {}", command.topic));

            let broker = ctx.broker.clone();
            let logger = ctx.logger.clone();
            let exec_topic = exec_topic.clone();
            let topic = command.topic.clone();

            init = init.subscribe(topic, move |topic, payload| {
                let command = command.clone();
                let broker = broker.clone();
                let logger = logger.clone();
                let exec_topic = exec_topic.clone();
                async move {
                    logger.info(format!("< {}: {}", topic, String::from_utf8_lossy(&payload)));

                    for action in &command.publish {
                        let out = match &action.payload {
                            Some(text) => text.clone().into_bytes(),
                            None => payload.clone(),
                        };
                        broker.publish(&action.topic, out).await?;
                    }

                    if let Some(cmd) = &command.exec {
                        let request = json!({
                            "cmd": cmd,
                            "success_tts": command.success_tts,
                            "error_tts": command.error_tts,
                        });
                        broker.publish(&exec_topic, request.to_string()).await?;
                    }
                    Ok(())
                }
            });
        }

        Ok(init)
    }
    .boxed()
}
