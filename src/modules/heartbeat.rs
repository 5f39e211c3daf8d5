//! Periodic liveness publisher
//!
//! Publishes `<count> <timestamp>` on `<base>/alive` every `interval_secs`
//! and answers `ok` on `<base>/status` when asked on `<base>/status` or
//! `<base>/status/get`. Toggling pauses and resumes both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::{MenuItem, ModuleContext, ModuleError, ModuleInit};

const DEFAULT_INTERVAL_SECS: u64 = 30;

pub fn init(ctx: ModuleContext) -> BoxFuture<'static, Result<ModuleInit, ModuleError>> {
    async move {
        let interval_secs = ctx.option_u64("interval_secs", DEFAULT_INTERVAL_SECS)?;
        if interval_secs == 0 {
            return Err(ModuleError::InvalidOption {
                key: "interval_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let paused = Arc::new(AtomicBool::new(false));
        let alive_topic = ctx.topic("alive");
        let status_topic = ctx.topic("status");
        let status_get_topic = ctx.topic("status/get");

        // Ticker lives as long as the subscription closure holding the guard
        let cancel = CancellationToken::new();
        let guard = Arc::new(cancel.clone().drop_guard());
        tokio::spawn(tick(
            ctx.clone(),
            alive_topic,
            Duration::from_secs(interval_secs),
            paused.clone(),
            cancel,
        ));

        let broker = ctx.broker.clone();
        let reply_paused = paused.clone();
        let reply_topic = status_topic.clone();
        let start_paused = paused.clone();
        let stop_paused = paused;
        let start_logger = ctx.logger.clone();
        let stop_logger = ctx.logger.clone();

        let init = ModuleInit::new()
            .subscribe(
                [status_topic.as_str(), status_get_topic.as_str()],
                move |_topic, payload| {
                    let _alive = &guard;
                    let broker = broker.clone();
                    let reply_topic = reply_topic.clone();
                    let paused = reply_paused.load(Ordering::SeqCst);
                    async move {
                        // Our own reply arrives on the same topic
                        if paused || payload == b"ok" {
                            return Ok(());
                        }
                        broker.publish(&reply_topic, "ok").await?;
                        Ok(())
                    }
                },
            )
            .on_start(move || {
                start_paused.store(false, Ordering::SeqCst);
                start_logger.info("resumed");
                Ok(())
            })
            .on_stop(move || {
                stop_paused.store(true, Ordering::SeqCst);
                stop_logger.info("paused");
                Ok(())
            })
            .menu_item(MenuItem::publish("Ping", status_get_topic));

        Ok(init)
    }
    .boxed()
}

async fn tick(
    ctx: ModuleContext,
    topic: String,
    period: Duration,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut count: u64 = 0;
    let mut interval = tokio::time::interval(period);
    // First tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                count += 1;
                let payload = format!("{} {}", count, Local::now().format("%Y-%m-%dT%H:%M:%S"));
                if let Err(e) = ctx.broker.publish(&topic, payload).await {
                    ctx.logger.debug(format!("alive not sent: {}", e));
                }
            }
        }
    }
    ctx.logger.debug("ticker stopped");
}
