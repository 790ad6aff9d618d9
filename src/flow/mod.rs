//! Flow Processor: the single consumer of the trigger queue. Registers one
//! execution context per configured flow and runs its actions in order.

pub mod actions;

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::{EventBroker, FlowTriggerMessage};
use crate::config::dbus::DbusConfig;
use crate::config::flow::FlowConfig;
use crate::context::{ExecutionContext, FlowContext, GlobalContext};
use crate::template::TemplateEngine;

struct Registration {
    flow: FlowConfig,
    context: FlowContext,
}

/// Runs the registered flows' actions as triggers arrive. Holds no
/// reference to the Bus Client or Broker Client — only the shared Event
/// Broker and Template Engine, per the no-cyclic-ownership design.
pub struct FlowProcessor {
    registrations: HashMap<String, Registration>,
    global: GlobalContext,
    template: Arc<TemplateEngine>,
    broker: EventBroker,
}

impl FlowProcessor {
    /// Registers every global flow and every subscription-attached flow
    /// found in `config`. A flow's context is derived from the subscription
    /// that declares it (as configured — the bus-name/path glob patterns
    /// themselves, not a resolved instance), so it is fixed for the
    /// lifetime of the process regardless of which concrete objects end up
    /// matching that subscription at runtime.
    pub fn new(flows: &[FlowConfig], dbus: &DbusConfig, global: GlobalContext, template: Arc<TemplateEngine>, broker: EventBroker) -> Self {
        let mut registrations = HashMap::new();

        for flow in flows {
            registrations.insert(flow.id.clone(), Registration { flow: flow.clone(), context: FlowContext::empty() });
        }

        for subscription in &dbus.subscriptions {
            let interfaces: Vec<String> = subscription.interfaces.iter().map(|i| i.interface.clone()).collect();
            let context = FlowContext::for_subscription(&subscription.bus_name, &subscription.path, &interfaces);
            for flow in &subscription.flows {
                registrations.insert(flow.id.clone(), Registration { flow: flow.clone(), context: context.clone() });
            }
        }

        Self { registrations, global, template, broker }
    }

    /// Drains the trigger queue until it closes, running each matched
    /// flow's actions to completion before moving to the next trigger.
    pub async fn run(self, mut trigger_rx: crate::queue::Receiver<FlowTriggerMessage>) {
        log::trace!("Starting flow processor");
        while let Some(message) = trigger_rx.recv().await {
            self.process_trigger(message).await;
            trigger_rx.task_done().await;
        }
        log::trace!("Terminated flow processor");
    }

    async fn process_trigger(&self, message: FlowTriggerMessage) {
        let Some(registration) = self.registrations.get(&message.flow_id) else {
            log::warn!("trigger for unregistered flow id {}", message.flow_id);
            return;
        };

        if message.trigger_kind == "schedule" {
            log::debug!("flow {} triggered by {}", message.flow_id, message.trigger_kind);
        } else {
            log::info!("flow {} triggered by {}", message.flow_id, message.trigger_kind);
        }

        let mut ctx = ExecutionContext::new(message.flow_id.clone(), self.global.clone(), registration.context.clone());
        ctx.seed_local(&message.context);

        for action in &registration.flow.actions {
            if let Err(err) = actions::execute_action(action, &mut ctx, &self.template, &self.broker).await {
                let text = err.to_string();
                if text.contains("was not provided by any .service files") {
                    log::debug!("flow {}: action failed: {text}", message.flow_id);
                } else {
                    log::warn!("flow {}: action failed: {text}", message.flow_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dbus::{BusType, InterfaceConfig, SignalConfig, SubscriptionConfig};
    use crate::config::flow::{FlowActionConfig, FlowTriggerConfig};

    fn empty_dbus_config() -> DbusConfig {
        DbusConfig { bus_type: BusType::Session, subscriptions: vec![] }
    }

    #[tokio::test]
    async fn unregistered_flow_id_is_logged_and_dropped() {
        let (broker, _queues) = EventBroker::new(4);
        let processor =
            FlowProcessor::new(&[], &empty_dbus_config(), GlobalContext::new(), Arc::new(TemplateEngine::new()), broker);

        processor
            .process_trigger(FlowTriggerMessage { flow_id: "missing".into(), trigger_kind: "schedule", context: serde_json::json!({}) })
            .await;
    }

    #[tokio::test]
    async fn subscription_flow_context_set_uses_configured_glob() {
        let (broker, mut queues) = EventBroker::new(4);

        let mut global_context = HashMap::new();
        global_context.insert("var1".to_string(), serde_yaml::Value::String("{{ subscription_bus_name }}".into()));
        let flow = FlowConfig {
            id: "flow-1".into(),
            name: None,
            triggers: vec![FlowTriggerConfig::Schedule { schedule: crate::config::flow::ScheduleSpec::Interval(Default::default()) }],
            actions: vec![FlowActionConfig::ContextSet { global_context, context: HashMap::new() }],
        };

        let dbus = DbusConfig {
            bus_type: BusType::Session,
            subscriptions: vec![SubscriptionConfig {
                bus_name: "test.bus_name.*".into(),
                path: "/test/path".into(),
                interfaces: vec![InterfaceConfig {
                    interface: "test.Interface".into(),
                    mqtt_command_topic: None,
                    mqtt_response_topic: None,
                    signals: vec![SignalConfig { signal: "Test".into(), filter: None }],
                    methods: vec![],
                    properties: vec![],
                }],
                flows: vec![flow],
                id: "sub-1".into(),
            }],
        };

        let global = GlobalContext::new();
        let processor = FlowProcessor::new(&[], &dbus, global.clone(), Arc::new(TemplateEngine::new()), broker);

        processor
            .process_trigger(FlowTriggerMessage { flow_id: "flow-1".into(), trigger_kind: "schedule", context: serde_json::json!({}) })
            .await;

        assert_eq!(global.snapshot().get("var1").unwrap(), "test.bus_name.*");
        drop(queues);
    }
}
