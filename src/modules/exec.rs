//! Shell command runner
//!
//! Subscribes `<base>/cmd`. The payload is either a plain command line or a
//! JSON object `{"cmd": "...", "success_tts": "...", "error_tts": "..."}`;
//! the optional texts are published to `<global base>/tts` after the command
//! finished.

use std::process::Stdio;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use tokio::process::Command;

use super::{ModuleContext, ModuleError, ModuleInit, ModuleLogger};
use crate::mqtt::SharedBroker;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecRequest {
    pub cmd: String,
    #[serde(default)]
    pub success_tts: Option<String>,
    #[serde(default)]
    pub error_tts: Option<String>,
}

impl ExecRequest {
    pub fn parse(payload: &[u8]) -> Self {
        if let Ok(request) = serde_json::from_slice::<ExecRequest>(payload) {
            return request;
        }
        Self {
            cmd: String::from_utf8_lossy(payload).trim().to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ExecOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

fn shell(cmd: &str) -> Command {
    #[cfg(windows)]
    {
        let mut command = Command::new("cmd");
        command.args(["/C", cmd]);
        command
    }
    #[cfg(not(windows))]
    {
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        command
    }
}

pub async fn run(cmd: &str) -> Result<ExecOutput, ModuleError> {
    let output = shell(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    Ok(ExecOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

async fn handle(
    request: ExecRequest,
    broker: SharedBroker,
    tts_topic: String,
    logger: ModuleLogger,
) -> Result<(), ModuleError> {
    if request.cmd.is_empty() {
        logger.warn("empty command ignored");
        return Ok(());
    }

    let tts = match run(&request.cmd).await {
        Ok(output) if output.success => {
            logger.info(format!("stdout: {}", output.stdout.trim_end()));
            if !output.stderr.is_empty() {
                logger.warn(format!("stderr: {}", output.stderr.trim_end()));
            }
            request.success_tts
        }
        Ok(output) => {
            logger.error(format!(
                "exec error: {} exited unsuccessfully: {}",
                request.cmd,
                output.stderr.trim_end()
            ));
            request.error_tts
        }
        Err(e) => {
            logger.error(format!("exec error: {}", e));
            request.error_tts
        }
    };

    if let Some(text) = tts {
        broker.publish(&tts_topic, text).await?;
    }
    Ok(())
}

pub fn init(ctx: ModuleContext) -> BoxFuture<'static, Result<ModuleInit, ModuleError>> {
    async move {
        let tts_topic = ctx.global_topic("tts");
        let ModuleContext {
            base,
            broker,
            logger,
            ..
        } = ctx;

        let init = ModuleInit::new().subscribe(format!("{}/cmd", base), move |topic, payload| {
            let request = ExecRequest::parse(&payload);
            logger.info(format!("< {}: {}", topic, request.cmd));
            handle(request, broker.clone(), tts_topic.clone(), logger.clone())
        });
        Ok(init)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tests::context;
    use crate::mqtt::{BrokerConnector, LoopbackBroker, MqttConfig};

    #[test]
    fn parse_accepts_json_and_plain_text() {
        let plain = ExecRequest::parse(b"echo hi\n");
        assert_eq!(plain.cmd, "echo hi");
        assert_eq!(plain.success_tts, None);

        let json = ExecRequest::parse(br#"{"cmd": "ls", "success_tts": "done"}"#);
        assert_eq!(json.cmd, "ls");
        assert_eq!(json.success_tts.as_deref(), Some("done"));
        assert_eq!(json.error_tts, None);
    }

    #[tokio::test]
    async fn subscribes_cmd_topic_without_hooks() {
        let init = init(context("exec", toml::Table::new())).await.unwrap();
        assert_eq!(init.subscriptions.len(), 1);
        assert!(init.subscriptions[0].topics.contains("home/pc/exec/cmd"));
        assert!(init.on_start.is_none() && init.on_stop.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn announces_result_on_tts_topic() {
        let loopback = LoopbackBroker::new();
        let ctx = context("exec", toml::Table::new());
        let (client, _events) = loopback.connect(&MqttConfig::default()).await.unwrap();
        ctx.broker.replace(Some(client)).await;

        let init = init(ctx).await.unwrap();
        let handler = init.subscriptions[0].handler.clone();

        handler(
            "home/pc/exec/cmd".into(),
            br#"{"cmd": "true", "success_tts": "ok", "error_tts": "fail"}"#.to_vec(),
        )
        .await
        .unwrap();
        handler(
            "home/pc/exec/cmd".into(),
            br#"{"cmd": "exit 3", "success_tts": "ok", "error_tts": "fail"}"#.to_vec(),
        )
        .await
        .unwrap();

        let spoken: Vec<_> = loopback
            .published_on("home/pc/tts")
            .into_iter()
            .map(|m| m.payload_str())
            .collect();
        assert_eq!(spoken, vec!["ok", "fail"]);
    }
}
