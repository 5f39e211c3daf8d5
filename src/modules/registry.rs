//! Static mapping from module name to factory

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::{commands, exec, heartbeat, ModuleContext, ModuleError, ModuleInit};

/// Async module constructor: `factory(ctx).await -> ModuleInit`
pub type ModuleFactory =
    Arc<dyn Fn(ModuleContext) -> BoxFuture<'static, Result<ModuleInit, ModuleError>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: BTreeMap<String, ModuleFactory>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

impl ModuleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every module shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("exec", exec::init);
        registry.register("commands", commands::init);
        registry.register("heartbeat", heartbeat::init);
        registry
    }

    /// Adds a factory, replacing any previous one with the same name
    pub fn register<F>(&mut self, name: &str, factory: F) -> Option<ModuleFactory>
    where
        F: Fn(ModuleContext) -> BoxFuture<'static, Result<ModuleInit, ModuleError>>
            + Send
            + Sync
            + 'static,
    {
        debug!("Registering module factory: {}", name);
        self.factories.insert(name.to_string(), Arc::new(factory))
    }

    pub fn get(&self, name: &str) -> Option<ModuleFactory> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn builtin_modules_are_registered() {
        let registry = ModuleRegistry::builtin();
        assert_eq!(registry.names(), vec!["commands", "exec", "heartbeat"]);
        assert!(registry.get("audio").is_none());
    }

    #[test]
    fn register_replaces_existing_factory() {
        let mut registry = ModuleRegistry::builtin();
        let previous = registry.register("exec", |_ctx| {
            async { Ok::<_, ModuleError>(ModuleInit::new()) }.boxed()
        });
        assert!(previous.is_some());
        assert!(registry.contains("exec"));
    }
}
