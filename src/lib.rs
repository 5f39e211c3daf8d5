//! Broker-to-device automation bridge.
//!
//! Connects to an MQTT broker, loads the configured modules and routes every
//! inbound message to the one module handler that owns its topic.

pub mod bridge;
pub mod config;
pub mod modules;
pub mod mqtt;
pub mod stdin;

pub use bridge::{Bridge, BridgeClient, BridgeError, BridgeWorker};
pub use config::Config;
pub use modules::{ModuleContext, ModuleError, ModuleInit, ModuleRegistry};
