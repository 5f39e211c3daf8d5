//! Runtime record of a loaded module.
//!
//! # State machine
//!
//! ```text
//! Active ──toggle──► Disabled ──toggle──► Enabled ──toggle──► Disabled ...
//!   │                   │                    │
//!   └───────────────────┴──── stop ──────────┴──► Stopped (terminal)
//! ```
//!
//! Toggle transitions only exist for stoppable handles (both hooks present).
//! Loading and load failures are handled by [`super::loader`]; a failed
//! module never gets a handle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::panic_message;
use super::{Hook, MenuItem, ModuleError, ModuleInit, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Active,
    Enabled,
    Disabled,
    Stopped,
}

/// Snapshot of a handle for command channel consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleStatus {
    pub name: String,
    pub enabled: bool,
    pub can_toggle: bool,
    pub state: ModuleState,
    pub menu_items: Vec<MenuItem>,
}

pub struct ModuleHandle {
    name: String,
    base: String,
    options: toml::Table,
    enabled: AtomicBool,
    state: Mutex<ModuleState>,
    subscriptions: Vec<Subscription>,
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
    menu_items: Vec<MenuItem>,
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl ModuleHandle {
    /// Builds the handle field by field; nothing from `init` can override the
    /// name, base or options taken from the configuration.
    pub(crate) fn new(name: String, base: String, options: toml::Table, init: ModuleInit) -> Self {
        let ModuleInit {
            subscriptions,
            on_start,
            on_stop,
            menu_items,
        } = init;

        Self {
            name,
            base,
            options,
            enabled: AtomicBool::new(true),
            state: Mutex::new(ModuleState::Active),
            subscriptions,
            on_start,
            on_stop,
            menu_items,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn options(&self) -> &toml::Table {
        &self.options
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn menu_items(&self) -> &[MenuItem] {
        &self.menu_items
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Both hooks present; UIs must grey out the toggle otherwise
    pub fn can_toggle(&self) -> bool {
        self.on_start.is_some() && self.on_stop.is_some()
    }

    pub fn state(&self) -> ModuleState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flips `enabled`, then runs the hook matching the new value.
    ///
    /// Without both hooks only the flag changes. Hooks run while the state
    /// lock is held and must not call back into the handle.
    pub fn toggle(&self) -> Result<bool, ModuleError> {
        let mut state = self.lock_state();
        if *state == ModuleState::Stopped {
            return Err(ModuleError::Stopped(self.name.clone()));
        }

        let enabled = !self.enabled.fetch_xor(true, Ordering::SeqCst);

        let (Some(on_start), Some(on_stop)) = (&self.on_start, &self.on_stop) else {
            warn!(
                "Module {} has no start/stop hooks, only flag changed (enabled = {})",
                self.name, enabled
            );
            return Ok(enabled);
        };

        if enabled {
            *state = ModuleState::Enabled;
            info!("Starting module {}", self.name);
            call_hook(on_start)?;
        } else {
            *state = ModuleState::Disabled;
            info!("Stopping module {}", self.name);
            call_hook(on_stop)?;
        }
        Ok(enabled)
    }

    /// Moves the handle into `Stopped`.
    ///
    /// Runs `on_stop` if the module is still running. Returns `None` when no
    /// hook was called, which includes every call after the first.
    pub(crate) fn stop(&self) -> Option<Result<(), ModuleError>> {
        let mut state = self.lock_state();
        let previous = std::mem::replace(&mut *state, ModuleState::Stopped);
        match previous {
            ModuleState::Stopped => {
                debug!("Module {} already stopped", self.name);
                None
            }
            // on_stop already ran when it was toggled off
            ModuleState::Disabled => None,
            ModuleState::Active | ModuleState::Enabled => {
                self.on_stop.as_ref().map(|hook| call_hook(hook))
            }
        }
    }

    pub fn status(&self) -> ModuleStatus {
        ModuleStatus {
            name: self.name.clone(),
            enabled: self.is_enabled(),
            can_toggle: self.can_toggle(),
            state: self.state(),
            menu_items: self.menu_items.clone(),
        }
    }
}

fn call_hook(hook: &Hook) -> Result<(), ModuleError> {
    match catch_unwind(AssertUnwindSafe(|| hook())) {
        Ok(result) => result,
        Err(panic) => Err(ModuleError::Panicked(panic_message(panic))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_init(starts: Arc<AtomicUsize>, stops: Arc<AtomicUsize>) -> ModuleInit {
        ModuleInit::new()
            .on_start(move || {
                starts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_stop(move || {
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
    }

    fn handle(init: ModuleInit) -> ModuleHandle {
        ModuleHandle::new("m".into(), "home/pc/m".into(), toml::Table::new(), init)
    }

    #[test]
    fn toggle_calls_matching_hook() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let handle = handle(counting_init(starts.clone(), stops.clone()));
        assert!(handle.can_toggle());
        assert_eq!(handle.state(), ModuleState::Active);

        assert!(!handle.toggle().unwrap());
        assert_eq!(handle.state(), ModuleState::Disabled);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(starts.load(Ordering::SeqCst), 0);

        assert!(handle.toggle().unwrap());
        assert_eq!(handle.state(), ModuleState::Enabled);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn toggle_without_both_hooks_never_calls_a_hook() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let handle = handle(ModuleInit::new().on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert!(!handle.can_toggle());

        assert!(!handle.toggle().unwrap());
        assert!(!handle.is_enabled());
        assert_eq!(handle.state(), ModuleState::Active);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_runs_hook_once() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let handle = handle(counting_init(starts, stops.clone()));

        assert!(matches!(handle.stop(), Some(Ok(()))));
        assert!(handle.stop().is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ModuleState::Stopped);
        assert!(matches!(handle.toggle(), Err(ModuleError::Stopped(_))));
    }

    #[test]
    fn stop_skips_hook_of_disabled_module() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let handle = handle(counting_init(starts, stops.clone()));

        handle.toggle().unwrap();
        assert!(handle.stop().is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_error_is_returned_unchanged() {
        let handle = handle(
            ModuleInit::new()
                .on_start(|| Ok(()))
                .on_stop(|| Err(ModuleError::Initialization("amp offline".into()))),
        );
        match handle.stop() {
            Some(Err(ModuleError::Initialization(msg))) => assert_eq!(msg, "amp offline"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(handle.state(), ModuleState::Stopped);
    }

    #[test]
    fn panicking_hook_becomes_error() {
        let handle = handle(
            ModuleInit::new()
                .on_start(|| Ok(()))
                .on_stop(|| panic!("boom")),
        );
        match handle.toggle() {
            Err(ModuleError::Panicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(handle.state(), ModuleState::Disabled);
    }
}
