//! Topic router
//!
//! Maps an exact topic string to the single handler that owns it. Handles
//! are walked in load order, so when two modules declare the same topic the
//! module loaded later takes it over. Within one module the first
//! subscription naming a topic keeps it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::modules::error::panic_message;
use crate::modules::{Handler, ModuleHandle};

#[derive(Clone)]
pub struct Route {
    pub module: String,
    pub handler: Handler,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("module", &self.module).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler was invoked and runs in its own task
    Routed { module: String },
    Unrouted,
    /// Handler panicked before returning its future
    Failed { module: String },
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Route>,
    /// Union of all declared topics, first appearance order
    topics: Vec<String>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(handles: &[Arc<ModuleHandle>]) -> Self {
        let mut table = Self::default();

        for handle in handles {
            let mut claimed: Vec<&str> = Vec::new();
            for subscription in handle.subscriptions() {
                for topic in subscription.topics.iter() {
                    if claimed.contains(&topic.as_str()) {
                        continue;
                    }
                    claimed.push(topic);

                    let route = Route {
                        module: handle.name().to_string(),
                        handler: subscription.handler.clone(),
                    };
                    match table.routes.insert(topic.clone(), route) {
                        Some(previous) => debug!(
                            "Topic {} taken over by {} (was {})",
                            topic,
                            handle.name(),
                            previous.module
                        ),
                        None => table.topics.push(topic.clone()),
                    }
                }
            }
        }

        table
    }

    /// Every routed topic, in first-declared order
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn route(&self, topic: &str) -> Option<&Route> {
        self.routes.get(topic)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Invokes the owning handler with `(topic, payload)`.
    ///
    /// The handler future is spawned, so a slow or failing handler never
    /// holds up the next message. Errors and panics are logged.
    pub fn dispatch(&self, topic: &str, payload: Vec<u8>) -> DispatchOutcome {
        let Some(route) = self.routes.get(topic) else {
            warn!("Cannot find handler for topic {}", topic);
            return DispatchOutcome::Unrouted;
        };

        let module = route.module.clone();
        let handler = route.handler.clone();
        let future = match catch_unwind(AssertUnwindSafe(|| handler(topic.to_string(), payload))) {
            Ok(future) => future,
            Err(panic) => {
                error!("Handler of {} panicked on {}: {}", module, topic, panic_message(panic));
                return DispatchOutcome::Failed { module };
            }
        };

        let task_module = module.clone();
        let task_topic = topic.to_string();
        tokio::spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Handler of {} failed on {}: {}", task_module, task_topic, e),
                Err(panic) => error!(
                    "Handler of {} panicked on {}: {}",
                    task_module,
                    task_topic,
                    panic_message(panic)
                ),
            }
        });

        DispatchOutcome::Routed { module }
    }
}
