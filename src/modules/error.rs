//! Error definitions for modules and their factories

use std::any::Any;

use crate::mqtt::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// No factory is registered under this name
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Handler error: {0}")]
    Handler(String),

    /// The handle reached its terminal state and needs a reload first
    #[error("Module {0} is stopped")]
    Stopped(String),

    #[error("Module panicked: {0}")]
    Panicked(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts the message of a caught panic
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
