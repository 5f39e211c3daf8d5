//! # Modules
//!
//! A module is a self-contained unit that reacts to broker topics and may
//! expose start/stop hooks. This file defines the contract between a module
//! factory and the bridge:
//!
//! ```text
//! ModuleSpec ──► ModuleContext ──► factory(ctx).await ──► ModuleInit ──► ModuleHandle
//!  (config)      (base, options,                          (subscriptions,   (owned by
//!                 broker, logger)                           hooks, menu)      the bridge)
//! ```
//!
//! Factories are looked up by name in the static [`ModuleRegistry`]. Topic
//! declarations are normalized into a [`TopicSet`] as soon as a module hands
//! them over, so the router only ever sees flat, ordered, duplicate-free sets.

pub mod commands;
pub mod error;
pub mod exec;
pub mod handle;
pub mod heartbeat;
pub mod loader;
pub mod registry;

pub use error::ModuleError;
pub use handle::{ModuleHandle, ModuleState, ModuleStatus};
pub use loader::ModuleLoader;
pub use registry::{ModuleFactory, ModuleRegistry};

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::mqtt::SharedBroker;

pub type HandlerFuture = BoxFuture<'static, Result<(), ModuleError>>;

/// Topic handler, invoked with `(topic, payload)`
pub type Handler = Arc<dyn Fn(String, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Zero-argument lifecycle hook (`on_start` / `on_stop`)
pub type Hook = Arc<dyn Fn() -> Result<(), ModuleError> + Send + Sync>;

/// Ordered set of topic strings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSet(Vec<String>);

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, topic: impl Into<String>) -> bool {
        let topic = topic.into();
        if self.0.contains(&topic) {
            return false;
        }
        self.0.push(topic);
        true
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.0.iter().any(|t| t == topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for TopicSet {
    fn from(topic: &str) -> Self {
        Self(vec![topic.to_string()])
    }
}

impl From<String> for TopicSet {
    fn from(topic: String) -> Self {
        Self(vec![topic])
    }
}

impl<T: Into<String>> FromIterator<T> for TopicSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = TopicSet::new();
        for topic in iter {
            set.insert(topic);
        }
        set
    }
}

impl From<Vec<String>> for TopicSet {
    fn from(topics: Vec<String>) -> Self {
        topics.into_iter().collect()
    }
}

impl<const N: usize> From<[&str; N]> for TopicSet {
    fn from(topics: [&str; N]) -> Self {
        topics.into_iter().collect()
    }
}

/// One `{topics, handler}` binding declared by a module
#[derive(Clone)]
pub struct Subscription {
    pub topics: TopicSet,
    pub handler: Handler,
}

impl Subscription {
    pub fn new<T, F, Fut>(topics: T, handler: F) -> Self
    where
        T: Into<TopicSet>,
        F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ModuleError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |topic, payload| handler(topic, payload).boxed());
        Self {
            topics: topics.into(),
            handler,
        }
    }
}

/// UI affordance contributed by a module; passed through to UIs untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuItem {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl MenuItem {
    pub fn publish(label: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            topic: Some(topic.into()),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// What a factory returns
#[derive(Default)]
pub struct ModuleInit {
    pub subscriptions: Vec<Subscription>,
    pub on_start: Option<Hook>,
    pub on_stop: Option<Hook>,
    pub menu_items: Vec<MenuItem>,
}

impl ModuleInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<T, F, Fut>(mut self, topics: T, handler: F) -> Self
    where
        T: Into<TopicSet>,
        F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ModuleError>> + Send + 'static,
    {
        self.subscriptions.push(Subscription::new(topics, handler));
        self
    }

    pub fn on_start(mut self, hook: impl Fn() -> Result<(), ModuleError> + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_stop(mut self, hook: impl Fn() -> Result<(), ModuleError> + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(hook));
        self
    }

    pub fn menu_item(mut self, item: MenuItem) -> Self {
        self.menu_items.push(item);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger handed to module factories, tags every line with the module name
#[derive(Debug, Clone)]
pub struct ModuleLogger {
    module: Arc<str>,
}

impl ModuleLogger {
    pub fn new(module: &str) -> Self {
        Self {
            module: Arc::from(module),
        }
    }

    pub fn log(&self, message: impl AsRef<str>, level: LogLevel) {
        let message = message.as_ref();
        let module = &*self.module;
        match level {
            LogLevel::Debug => debug!(module, "{}", message),
            LogLevel::Info => info!(module, "{}", message),
            LogLevel::Warn => warn!(module, "{}", message),
            LogLevel::Error => error!(module, "{}", message),
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(message, LogLevel::Debug)
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(message, LogLevel::Info)
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(message, LogLevel::Warn)
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(message, LogLevel::Error)
    }
}

/// Everything a factory gets to build its module
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub name: String,
    /// Topic namespace of this module
    pub base: String,
    /// Global topic prefix (`[mqtt].base`)
    pub global_base: String,
    /// Module options from the config file, always including `base`
    pub options: toml::Table,
    pub broker: SharedBroker,
    pub logger: ModuleLogger,
}

impl ModuleContext {
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.base, suffix)
    }

    pub fn global_topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.global_base, suffix)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn option_u64(&self, key: &str, default: u64) -> Result<u64, ModuleError> {
        match self.options.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(value)) if *value >= 0 => Ok(*value as u64),
            Some(other) => Err(ModuleError::InvalidOption {
                key: key.to_string(),
                reason: format!("expected a non-negative integer, got {}", other),
            }),
        }
    }

    /// Deserializes the whole option table into a typed struct
    pub fn options_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ModuleError> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e: toml::de::Error| ModuleError::InvalidOption {
                key: self.name.clone(),
                reason: e.message().to_string(),
            })
    }
}
