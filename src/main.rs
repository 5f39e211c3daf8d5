use std::fs::File;
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use mqttbridge::config::Config;
use mqttbridge::modules::ModuleRegistry;
use mqttbridge::mqtt::RumqttConnector;
use mqttbridge::{stdin, Bridge, BridgeWorker};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = Config::resolve_path();
    let config = Config::load(&path).await?;
    setup_logging_env(config.max_level(), config.log.open()?);
    debug!("Configuration loaded from {}", path.display());

    let mut bridge = Bridge::new(
        config,
        Arc::new(RumqttConnector::new()),
        ModuleRegistry::builtin(),
    )
    .with_config_path(path);
    bridge.start().await?;

    let (client, worker) = BridgeWorker::spawn(bridge);
    let quit = CancellationToken::new();
    let _stdin = stdin::spawn(client.clone(), quit.clone());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Unable to listen for shutdown signal: {}", e);
            }
            info!("Ctrl-C received");
        }
        _ = quit.cancelled() => info!("Quit requested"),
    }

    client.shutdown().await?;
    worker.await?;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }

    // Keep the process alive; log what escaped the module boundaries
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("An uncaught error occurred: {}", info);
        default_hook(info);
    }));
    Ok(())
}

fn setup_logging_env(level: Level, log_file: Option<File>) {
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match log_file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(std::io::stdout.and(Mutex::new(file)))
            .init(),
        None => builder.pretty().init(),
    }
}
