//! Hook registry and the plugin registration contract
//!
//! Plugins implement [`Plugin`] and add callables to a [`HookRegistry`].
//! How plugins are discovered is up to the host binary. Hooks for an event
//! run in ascending priority order; each one is isolated, so an error or a
//! panic is logged and the remaining hooks still run.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Points at which hooks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// The daemon accepted a request (before it is queued)
    RequestReceived,
    /// A task finished, successfully or not
    RequestCompleted,
    /// The client finished one retry/fallback attempt
    RetryAttempt,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::RequestReceived => "request_received",
            HookEvent::RequestCompleted => "request_completed",
            HookEvent::RetryAttempt => "retry_attempt",
        }
    }
}

pub type HookFn = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

struct RegisteredHook {
    name: String,
    priority: i32,
    callback: HookFn,
}

/// Contract implemented by loadable extensions
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, registry: &mut HookRegistry);
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<HookEvent, Vec<RegisteredHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook; lower priority runs first, ties keep registration order
    pub fn register<F>(&mut self, event: HookEvent, name: impl Into<String>, priority: i32, callback: F)
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let hooks = self.hooks.entry(event).or_default();
        hooks.push(RegisteredHook {
            name: name.into(),
            priority,
            callback: Arc::new(callback),
        });
        hooks.sort_by_key(|h| h.priority);
    }

    pub fn add_plugin(&mut self, plugin: &dyn Plugin) {
        plugin.register(self);
    }

    /// Names of the hooks for `event`, in run order
    pub fn hook_names(&self, event: HookEvent) -> Vec<&str> {
        self.hooks
            .get(&event)
            .map(|hooks| hooks.iter().map(|h| h.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Run every hook for `event`; returns how many completed without error
    pub fn fire(&self, event: HookEvent, payload: &Value) -> usize {
        let Some(hooks) = self.hooks.get(&event) else {
            return 0;
        };

        let mut succeeded = 0;
        for hook in hooks {
            match catch_unwind(AssertUnwindSafe(|| (hook.callback)(payload))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    warn!(event = event.as_str(), hook = %hook.name, error = %e, "hook failed");
                }
                Err(_) => {
                    warn!(event = event.as_str(), hook = %hook.name, "hook panicked");
                }
            }
        }
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_hooks_run_in_priority_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();
        for (name, priority) in [("late", 10), ("early", -5), ("middle", 0)] {
            let order = order.clone();
            registry.register(HookEvent::RequestReceived, name, priority, move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        assert_eq!(registry.fire(HookEvent::RequestReceived, &json!({})), 3);
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let ran = Arc::new(Mutex::new(false));
        let mut registry = HookRegistry::new();
        registry.register(HookEvent::RequestCompleted, "errors", 0, |_| anyhow::bail!("nope"));
        registry.register(HookEvent::RequestCompleted, "panics", 1, |_| panic!("boom"));
        let flag = ran.clone();
        registry.register(HookEvent::RequestCompleted, "survivor", 2, move |payload| {
            assert_eq!(payload["exit_code"], 0);
            *flag.lock().unwrap() = true;
            Ok(())
        });

        let ok = registry.fire(HookEvent::RequestCompleted, &json!({"exit_code": 0}));
        assert_eq!(ok, 1);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_plugin_registers_hooks() {
        struct Audit;
        impl Plugin for Audit {
            fn name(&self) -> &str {
                "audit"
            }
            fn register(&self, registry: &mut HookRegistry) {
                registry.register(HookEvent::RetryAttempt, "audit.retry", 0, |_| Ok(()));
            }
        }

        let mut registry = HookRegistry::new();
        registry.add_plugin(&Audit);
        assert_eq!(registry.hook_names(HookEvent::RetryAttempt), vec!["audit.retry"]);
        assert!(registry.hook_names(HookEvent::RequestReceived).is_empty());
    }
}
