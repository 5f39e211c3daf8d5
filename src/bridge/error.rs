use crate::config::ConfigError;
use crate::modules::ModuleError;
use crate::mqtt::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("No loaded module named {0}")]
    UnknownModule(String),

    #[error("Bridge has not been started")]
    NotStarted,

    #[error("Bridge is shut down")]
    ShutDown,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Bridge command channel closed")]
    ChannelClosed,
}
