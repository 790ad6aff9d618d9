//! Execution context: the merged global/flow/local scopes templates and
//! actions render against.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as Json;

/// Process-wide context shared by every flow execution. Mutated only by the
/// Flow Processor (via `context_set` actions); everyone else holds a
/// read-only clone of its snapshot.
#[derive(Clone, Default)]
pub struct GlobalContext(Arc<RwLock<HashMap<String, Json>>>);

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `updates` into the global scope. Only called by the Flow
    /// Processor's `context_set` action handling.
    pub fn merge(&self, updates: HashMap<String, Json>) {
        let mut guard = self.0.write().expect("global context lock poisoned");
        guard.extend(updates);
    }

    pub fn snapshot(&self) -> HashMap<String, Json> {
        self.0.read().expect("global context lock poisoned").clone()
    }
}

/// Read-only per-subscription scope: populated once when a flow is
/// registered against a subscription, empty for flows with no
/// subscription (e.g. global schedule-only flows).
#[derive(Debug, Clone, Default)]
pub struct FlowContext(HashMap<String, Json>);

impl FlowContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_subscription(bus_name: &str, path: &str, interfaces: &[String]) -> Self {
        let mut map = HashMap::new();
        map.insert("subscription_bus_name".to_string(), Json::String(bus_name.to_string()));
        map.insert("subscription_path".to_string(), Json::String(path.to_string()));
        map.insert(
            "subscription_interfaces".to_string(),
            Json::Array(interfaces.iter().cloned().map(Json::String).collect()),
        );
        Self(map)
    }

    pub fn as_map(&self) -> &HashMap<String, Json> {
        &self.0
    }
}

/// A single flow execution's merged view: global (low precedence), flow
/// (mid), local (high, mutable, seeded from the trigger).
pub struct ExecutionContext {
    pub name: String,
    global: GlobalContext,
    flow: FlowContext,
    local: HashMap<String, Json>,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>, global: GlobalContext, flow: FlowContext) -> Self {
        Self { name: name.into(), global, flow, local: HashMap::new() }
    }

    /// Seeds the local scope from a trigger's context map, as found on a
    /// freshly dequeued `FlowTriggerMessage`.
    pub fn seed_local(&mut self, trigger_context: &Json) {
        if let Json::Object(map) = trigger_context {
            for (k, v) in map {
                self.local.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: Json) {
        self.local.insert(key.into(), value);
    }

    pub fn global(&self) -> &GlobalContext {
        &self.global
    }

    /// Produces the merged global + flow + local view, local taking
    /// precedence over flow, flow over global.
    pub fn aggregated(&self) -> HashMap<String, Json> {
        let mut merged = self.global.snapshot();
        merged.extend(self.flow.as_map().clone());
        merged.extend(self.local.clone());
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_respects_precedence() {
        let global = GlobalContext::new();
        global.merge(HashMap::from([("k".to_string(), Json::String("global".into()))]));
        let flow = FlowContext::for_subscription("bus.name", "/path", &["iface".to_string()]);

        let mut ctx = ExecutionContext::new("flow-1", global, flow);
        let merged = ctx.aggregated();
        assert_eq!(merged.get("k").unwrap(), "global");
        assert_eq!(merged.get("subscription_bus_name").unwrap(), "bus.name");

        ctx.set_local("k", Json::String("local".into()));
        let merged = ctx.aggregated();
        assert_eq!(merged.get("k").unwrap(), "local");
    }

    #[test]
    fn seed_local_copies_trigger_context() {
        let mut ctx = ExecutionContext::new("flow-1", GlobalContext::new(), FlowContext::empty());
        ctx.seed_local(&serde_json::json!({"bus_name": "a", "path": "/p"}));
        let merged = ctx.aggregated();
        assert_eq!(merged.get("bus_name").unwrap(), "a");
    }
}
