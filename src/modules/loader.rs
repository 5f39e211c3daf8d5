//! Module loader with statum state machine for the load pipeline
//!
//! Every enabled [`ModuleSpec`] goes through the same two steps, one module at
//! a time and in configuration order:
//!
//! ```text
//! ModuleSpec ──resolve──► Resolved ──initialize().await──► Initialized ──► ModuleHandle
//!                                          │
//!                                          └── Err(ModuleError): logged, module skipped
//! ```
//!
//! Loading is never parallelized. Modules may depend on process-wide
//! singletons whose setup order matters, and the startup log is read in that
//! order when debugging.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use statum::{machine, state};
use tracing::{debug, error, info};

use super::error::panic_message;
use super::{ModuleContext, ModuleError, ModuleHandle, ModuleInit, ModuleLogger, ModuleRegistry};
use crate::config::ModuleSpec;
use crate::mqtt::{MqttConfig, SharedBroker};

/// States of a single module load
#[state]
#[derive(Debug, Clone)]
pub enum LoadState {
    Resolved,    // Base topic computed, factory not yet called
    Initialized, // Factory returned successfully
}

#[machine]
pub struct ModuleLoad<S: LoadState> {
    name: String,
    base: String,
    options: toml::Table,
    init: Option<ModuleInit>,
}

impl<S: LoadState> ModuleLoad<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}

impl ModuleLoad<Resolved> {
    /// Computes the effective base and folds it into the options
    pub fn resolve(spec: &ModuleSpec, mqtt: &MqttConfig) -> Self {
        let base = spec
            .base
            .clone()
            .unwrap_or_else(|| mqtt.module_base(&spec.name));
        let mut options = spec.options.clone();
        options.insert("base".to_string(), toml::Value::String(base.clone()));

        Self::new(spec.name.clone(), base, options, None)
    }

    /// Runs the factory and transitions to `Initialized`
    pub async fn initialize(
        mut self,
        registry: &ModuleRegistry,
        broker: &SharedBroker,
        global_base: &str,
    ) -> Result<ModuleLoad<Initialized>, ModuleError> {
        let factory = registry
            .get(&self.name)
            .ok_or_else(|| ModuleError::UnknownModule(self.name.clone()))?;

        let context = ModuleContext {
            name: self.name.clone(),
            base: self.base.clone(),
            global_base: global_base.to_string(),
            options: self.options.clone(),
            broker: broker.clone(),
            logger: ModuleLogger::new(&self.name),
        };

        let future = catch_unwind(AssertUnwindSafe(|| factory(context)))
            .map_err(|panic| ModuleError::Panicked(panic_message(panic)))?;
        let init = AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .map_err(|panic| ModuleError::Panicked(panic_message(panic)))??;

        debug!(
            "Module {} declared {} subscription(s)",
            self.name,
            init.subscriptions.len()
        );
        self.init = Some(init);
        Ok(self.transition())
    }
}

impl ModuleLoad<Initialized> {
    pub fn into_handle(self) -> ModuleHandle {
        ModuleHandle::new(
            self.name,
            self.base,
            self.options,
            self.init.unwrap_or_default(),
        )
    }
}

/// Turns module specs into handles
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    registry: ModuleRegistry,
    mqtt: MqttConfig,
    debug: bool,
}

impl ModuleLoader {
    pub fn new(registry: ModuleRegistry, mqtt: MqttConfig, debug: bool) -> Self {
        Self {
            registry,
            mqtt,
            debug,
        }
    }

    /// Picks up new broker settings and debug flag after a config reload
    pub fn reconfigure(&mut self, mqtt: MqttConfig, debug: bool) {
        self.mqtt = mqtt;
        self.debug = debug;
    }

    /// Loads `specs` sequentially. Never fails as a whole: a module whose
    /// factory fails is logged and left out of the result.
    pub async fn load(&self, specs: &[ModuleSpec], broker: &SharedBroker) -> Vec<Arc<ModuleHandle>> {
        let mut handles = Vec::with_capacity(specs.len());

        for spec in specs {
            info!("load module: {}", spec.name);

            let result = ModuleLoad::resolve(spec, &self.mqtt)
                .initialize(&self.registry, broker, &self.mqtt.base)
                .await;

            match result {
                Ok(loaded) => handles.push(Arc::new(loaded.into_handle())),
                Err(e) => {
                    error!("Failed to load module {}", spec.name);
                    if self.debug {
                        error!("{:?}", e);
                    } else {
                        error!("{}", e);
                    }
                }
            }
        }

        info!("{} of {} module(s) loaded", handles.len(), specs.len());
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    fn spec(name: &str) -> ModuleSpec {
        ModuleSpec {
            name: name.to_string(),
            enabled: true,
            base: None,
            options: toml::Table::new(),
        }
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("ok", |ctx: ModuleContext| -> BoxFuture<'static, Result<ModuleInit, ModuleError>> {
            async move {
                let topic = ctx.topic("set");
                Ok(ModuleInit::new().subscribe(topic, |_, _| async { Ok(()) }))
            }
            .boxed()
        });
        registry.register("fails", |_ctx: ModuleContext| -> BoxFuture<'static, Result<ModuleInit, ModuleError>> {
            async { Err(ModuleError::Initialization("device missing".into())) }.boxed()
        });
        registry.register("panics", |_ctx: ModuleContext| -> BoxFuture<'static, Result<ModuleInit, ModuleError>> {
            panic!("factory exploded")
        });
        registry
    }

    #[test]
    fn resolve_defaults_base_under_global_prefix() {
        let mqtt = MqttConfig {
            base: "home/pc".into(),
            ..Default::default()
        };
        let load = ModuleLoad::resolve(&spec("audio"), &mqtt);
        assert_eq!(load.base(), "home/pc/audio");
        assert_eq!(
            load.options.get("base").and_then(|v| v.as_str()),
            Some("home/pc/audio")
        );

        let mut custom = spec("audio");
        custom.base = Some("elsewhere".into());
        assert_eq!(ModuleLoad::resolve(&custom, &mqtt).base(), "elsewhere");
    }

    #[tokio::test]
    async fn failing_modules_are_skipped() {
        let loader = ModuleLoader::new(registry(), MqttConfig::default(), false);
        let specs = vec![
            spec("ok"),
            spec("fails"),
            spec("unknown"),
            spec("panics"),
            spec("ok"),
        ];

        let handles = loader.load(&specs, &SharedBroker::new()).await;

        assert_eq!(handles.len(), 2);
        assert!(handles.iter().all(|h| h.name() == "ok"));
        assert_eq!(handles[0].subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn unknown_module_is_reported() {
        let load = ModuleLoad::resolve(&spec("nope"), &MqttConfig::default());
        let result = load
            .initialize(&ModuleRegistry::new(), &SharedBroker::new(), "home")
            .await;
        assert!(matches!(result, Err(ModuleError::UnknownModule(name)) if name == "nope"));
    }
}
