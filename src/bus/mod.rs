//! Bus Client: connects to the message bus, tracks the configured
//! subscriptions' lifecycle, and plumbs signals and commands through the
//! Event Broker.

pub mod dbus_value;
pub mod introspect;
pub mod signature;
pub mod vendor_patches;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dbus::message::{MatchRule, SignalArgs};
use dbus::nonblock::stdintf::org_freedesktop_dbus::{
    Introspectable, ObjectManagerInterfacesAdded, ObjectManagerInterfacesRemoved,
};
use dbus::nonblock::SyncConnection;
use dbus::Message;
use serde_json::Value as Json;
use tokio::sync::{mpsc, Mutex};

use crate::broker::{BusSignalEvent, EventBroker, FlowTriggerMessage, InboundBrokerMessage, OutboundBrokerMessage};
use crate::config::dbus::{DbusConfig, SubscriptionConfig};
use crate::config::flow::FlowTriggerConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::scheduler::FlowSetController;
use crate::template::{ResultKind, Template, TemplateEngine};
use crate::value::Value;
use introspect::IntrospectNode;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime state of a tracked bus name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Discovered,
    Watched,
    Draining,
}

/// Runtime record for a well-known bus name: which paths are being
/// watched, and under which interfaces.
#[derive(Debug, Default)]
pub struct BusNameSubscription {
    pub state: Option<SubscriptionState>,
    /// path -> subscribed interface names
    pub path_objects: HashMap<String, Vec<String>>,
}

/// Connects to the bus, tracks subscriptions, and bridges bus events and
/// commands onto the Event Broker.
pub struct BusClient {
    connection: Arc<SyncConnection>,
    config: DbusConfig,
    broker: EventBroker,
    template: Arc<TemplateEngine>,
    flow_sets: Arc<dyn FlowSetController>,
    subscriptions: Mutex<HashMap<String, BusNameSubscription>>,
    /// Signals always carry the sender's unique (`:N.M`) connection name, not
    /// the well-known name subscriptions are keyed by; this tracks the
    /// mapping learned from `NameOwnerChanged`/`GetNameOwner`.
    unique_names: Mutex<HashMap<String, String>>,
}

impl BusClient {
    pub fn new(
        connection: Arc<SyncConnection>, config: DbusConfig, broker: EventBroker, template: Arc<TemplateEngine>,
        flow_sets: Arc<dyn FlowSetController>,
    ) -> Self {
        Self {
            connection,
            config,
            broker,
            template,
            flow_sets,
            subscriptions: Mutex::new(HashMap::new()),
            unique_names: Mutex::new(HashMap::new()),
        }
    }

    async fn bus_name_for_sender(&self, sender: &str) -> Option<String> {
        self.unique_names.lock().await.get(sender).cloned()
    }

    fn proxy<'a>(&'a self, bus_name: &str, path: &str) -> dbus::nonblock::Proxy<'a, Arc<SyncConnection>> {
        dbus::nonblock::Proxy::new(bus_name.to_string(), path.to_string(), CALL_TIMEOUT, self.connection.clone())
    }

    async fn introspect_path(&self, bus_name: &str, path: &str) -> Result<IntrospectNode> {
        if let Some(patched) = vendor_patches::lookup(bus_name, path) {
            return patched;
        }
        let proxy = self.proxy(bus_name, path);
        let xml = proxy.introspect().await?;
        let node = introspect::parse(&xml)?;
        if node.interfaces.is_empty() {
            if let Some(fallback) = vendor_patches::fallback_for_empty(bus_name, path) {
                return fallback;
            }
        }
        Ok(node)
    }

    /// Connects to the bus and runs the startup sequence: installs
    /// `NameOwnerChanged`/`InterfacesAdded`/`InterfacesRemoved` match rules,
    /// lists current names, and runs the add-name sequence for any
    /// already-present configured bus name. Then runs the event loop until
    /// cancelled.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        log::trace!("Starting event loop for bus client");

        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<Message>();

        let name_owner_rule = MatchRule::new_signal("org.freedesktop.DBus", "NameOwnerChanged");
        let tx = msg_tx.clone();
        let _name_owner_match =
            self.connection.add_match(name_owner_rule).await?.msg_cb(move |msg| {
                let _ = tx.send(msg);
                true
            });

        // Broad signal match: subscribed interfaces and their signal names
        // are only known from introspection at runtime, so a single
        // sender-unfiltered rule is used rather than one per interface.
        let mut signal_rule = MatchRule::new();
        signal_rule.msg_type = Some(dbus::message::MessageType::Signal);
        let tx = msg_tx.clone();
        let _signal_match = self.connection.add_match(signal_rule).await?.msg_cb(move |msg| {
            let _ = tx.send(msg);
            true
        });

        let bus_proxy = self.proxy("org.freedesktop.DBus", "/org/freedesktop/DBus");
        let (names,): (Vec<String>,) =
            bus_proxy.method_call("org.freedesktop.DBus", "ListNames", ()).await?;
        for bus_name in names {
            if self.config.is_bus_name_configured(&bus_name) {
                if let Ok((owner,)) = bus_proxy
                    .method_call::<(String,), _, _>("org.freedesktop.DBus", "GetNameOwner", (bus_name.clone(),))
                    .await
                {
                    self.unique_names.lock().await.insert(owner, bus_name.clone());
                }
                self.handle_bus_name_added(&bus_name).await?;
            }
        }

        loop {
            tokio::select! {
                msg = msg_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }
            }
        }

        log::trace!("Terminated event loop for bus client");
        Ok(())
    }

    async fn handle_message(&self, msg: Message) {
        if msg.member().as_deref() == Some("NameOwnerChanged")
            && msg.interface().as_deref() == Some("org.freedesktop.DBus")
        {
            if let Some((name, old_owner, new_owner)) = msg.get3::<String, String, String>() {
                if !new_owner.is_empty() && old_owner.is_empty() {
                    self.unique_names.lock().await.insert(new_owner.clone(), name.clone());
                    if let Err(err) = self.handle_bus_name_added(&name).await {
                        log::warn!("handle_bus_name_added({name}) failed: {err}");
                    }
                } else if new_owner.is_empty() && !old_owner.is_empty() {
                    self.unique_names.lock().await.remove(&old_owner);
                    self.handle_bus_name_removed(&name).await;
                }
            }
            return;
        }

        if let Some(ObjectManagerInterfacesAdded { object, interfaces }) =
            ObjectManagerInterfacesAdded::from_message(&msg)
        {
            if let Some(sender) = msg.sender().map(|s| s.to_string()) {
                self.handle_interfaces_added(&sender, object.to_string(), interfaces.into_keys().collect()).await;
            }
            return;
        }

        if let Some(ObjectManagerInterfacesRemoved { object, interfaces }) =
            ObjectManagerInterfacesRemoved::from_message(&msg)
        {
            if let Some(sender) = msg.sender().map(|s| s.to_string()) {
                self.handle_interfaces_removed(&sender, object.to_string(), interfaces).await;
            }
            return;
        }

        self.handle_bus_signal(msg).await;
    }

    /// Runs the subscription logic for a single newly-added path, mirroring
    /// the add-name sequence but scoped to one object.
    async fn handle_interfaces_added(&self, sender: &str, path: String, interface_names: Vec<String>) {
        let Some(bus_name) = self.bus_name_for_sender(sender).await else { return };
        if !self.config.is_bus_name_configured(&bus_name) {
            return;
        }

        let node = match self.introspect_path(&bus_name, &path).await {
            Ok(node) => node,
            Err(err) => {
                log::warn!("bus.introspect failed, bus_name={bus_name}, path={path}: {err}");
                return;
            }
        };

        for subscription_config in self.config.subscription_configs(&bus_name, Some(&path)) {
            for interface_name in &interface_names {
                let Some(interface) = node.interfaces.iter().find(|i| &i.name == interface_name) else { continue };
                let Some(interface_config) =
                    subscription_config.interfaces.iter().find(|i| i.interface == interface.name)
                else {
                    continue;
                };

                self.attach_interface(&bus_name, &path, interface_config).await;
                self.flow_sets.start_flow_set(&subscription_config.flows);
                self.fire_lifecycle_trigger(subscription_config, &bus_name, &path, "object_added").await;
            }
        }
    }

    /// Mirrors the remove-name sequence at path granularity: fires
    /// `object_removed`, drains the trigger queue, detaches the path, and —
    /// if the bus name has no paths left — removes the whole subscription.
    async fn handle_interfaces_removed(&self, sender: &str, path: String, _interfaces: Vec<String>) {
        let Some(bus_name) = self.bus_name_for_sender(sender).await else { return };

        let had_path = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions.get(&bus_name).map(|s| s.path_objects.contains_key(&path)).unwrap_or(false)
        };
        if !had_path {
            return;
        }

        for subscription_config in self.config.subscription_configs(&bus_name, Some(&path)) {
            self.fire_lifecycle_trigger(subscription_config, &bus_name, &path, "object_removed").await;
        }

        self.broker.flow_trigger.join().await;

        let now_empty = {
            let mut subscriptions = self.subscriptions.lock().await;
            if let Some(sub) = subscriptions.get_mut(&bus_name) {
                sub.path_objects.remove(&path);
                sub.path_objects.is_empty()
            } else {
                false
            }
        };
        if now_empty {
            self.subscriptions.lock().await.remove(&bus_name);
            log::info!("bus-name subscription emptied by interfaces-removed: {bus_name}");
        }
    }

    /// Dispatches any other signal (e.g. `PropertiesChanged`, or an
    /// interface-specific signal such as MPRIS's `Seeked`) that arrived on
    /// an object path this client watches.
    async fn handle_bus_signal(&self, msg: Message) {
        let Some(sender) = msg.sender().map(|s| s.to_string()) else { return };
        let Some(path) = msg.path().map(|p| p.to_string()) else { return };
        let Some(signal_interface) = msg.interface().map(|i| i.to_string()) else { return };
        let Some(signal_name) = msg.member().map(|m| m.to_string()) else { return };

        let Some(bus_name) = self.bus_name_for_sender(&sender).await else { return };

        let (watched, is_properties_changed) = {
            let subscriptions = self.subscriptions.lock().await;
            let Some(sub) = subscriptions.get(&bus_name) else { return };
            let Some(interfaces) = sub.path_objects.get(&path) else { return };
            (!interfaces.is_empty(), signal_interface == "org.freedesktop.DBus.Properties")
        };
        if !watched {
            return;
        }

        let items = msg.get_items();
        let args: Vec<Value> = items.iter().map(|i| dbus_value::unwrap_refarg(i.as_ref())).collect();

        // `PropertiesChanged`'s own first argument names the interface the
        // change belongs to; every other signal is already scoped by its
        // own declaring interface.
        let interface = if is_properties_changed {
            items.first().and_then(|i| i.as_str()).unwrap_or(&signal_interface).to_string()
        } else {
            signal_interface
        };

        {
            let subscriptions = self.subscriptions.lock().await;
            let Some(sub) = subscriptions.get(&bus_name) else { return };
            let Some(interfaces) = sub.path_objects.get(&path) else { return };
            if !interfaces.iter().any(|i| i == &interface) {
                return;
            }
        }

        let event = BusSignalEvent { bus_name, path, interface, signal: signal_name, args };
        if let Err(err) = self.broker.bus_signal.send(event).await {
            log::warn!("bus_signal queue closed: {err:?}");
        }
    }

    /// Runs the add-name sequence for a bus name that now has an owner.
    async fn handle_bus_name_added(&self, bus_name: &str) -> Result<()> {
        if !self.config.is_bus_name_configured(bus_name) {
            return Ok(());
        }

        let visited = introspect::walk(
            "/",
            &|path: String| {
                let bus_name = bus_name.to_string();
                async move { self.introspect_path(&bus_name, &path).await }
            },
        )
        .await;

        {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.entry(bus_name.to_string()).or_insert_with(|| BusNameSubscription {
                state: Some(SubscriptionState::Discovered),
                path_objects: HashMap::new(),
            });
        }

        // `bus_name_added` fires once per subscription-config; `object_added`
        // fires once per distinct matched object (subscription_id, path), so
        // the two need separate dedup sets.
        let mut processed_subscriptions = std::collections::HashSet::new();
        let mut processed_objects = std::collections::HashSet::new();

        for (path, node) in visited {
            let subscription_configs = self.config.subscription_configs(bus_name, Some(&path));
            for subscription_config in subscription_configs {
                let mut matched_interface = false;
                for interface in &node.interfaces {
                    let Some(interface_config) =
                        subscription_config.interfaces.iter().find(|i| i.interface == interface.name)
                    else {
                        continue;
                    };

                    self.attach_interface(bus_name, &path, interface_config).await;
                    matched_interface = true;
                }

                if !matched_interface {
                    continue;
                }

                if !processed_subscriptions.contains(&subscription_config.id) {
                    self.flow_sets.start_flow_set(&subscription_config.flows);
                    self.fire_lifecycle_trigger(subscription_config, bus_name, &path, "bus_name_added").await;
                    processed_subscriptions.insert(subscription_config.id.clone());
                }

                let object_key = (subscription_config.id.clone(), path.clone());
                if !processed_objects.contains(&object_key) {
                    self.fire_lifecycle_trigger(subscription_config, bus_name, &path, "object_added").await;
                    processed_objects.insert(object_key);
                }
            }
        }

        Ok(())
    }

    async fn attach_interface(
        &self, bus_name: &str, path: &str, interface_config: &crate::config::dbus::InterfaceConfig,
    ) {
        let mut subscriptions = self.subscriptions.lock().await;
        let sub = subscriptions.entry(bus_name.to_string()).or_default();
        sub.state = Some(SubscriptionState::Watched);
        let interfaces = sub.path_objects.entry(path.to_string()).or_default();
        if !interfaces.contains(&interface_config.interface) {
            interfaces.push(interface_config.interface.clone());
        }
        log::info!(
            "subscribed: bus_name={bus_name}, path={path}, interface={}",
            interface_config.interface
        );
    }

    async fn fire_lifecycle_trigger(
        &self, subscription_config: &SubscriptionConfig, bus_name: &str, path: &str, trigger_kind: &'static str,
    ) {
        for flow in &subscription_config.flows {
            for trigger in &flow.triggers {
                let matches = match (trigger_kind, trigger) {
                    ("bus_name_added", FlowTriggerConfig::BusNameAdded) => true,
                    ("bus_name_removed", FlowTriggerConfig::BusNameRemoved) => true,
                    ("object_added", FlowTriggerConfig::ObjectAdded) => true,
                    ("object_removed", FlowTriggerConfig::ObjectRemoved) => true,
                    _ => false,
                };
                if !matches {
                    continue;
                }
                let context = serde_json::json!({"bus_name": bus_name, "path": path});
                let message = FlowTriggerMessage { flow_id: flow.id.clone(), trigger_kind, context };
                if let Err(err) = self.broker.flow_trigger.send(message).await {
                    log::warn!("flow_trigger queue closed: {err:?}");
                }
            }
        }
    }

    /// Runs the remove-name sequence: fires `bus_name_removed`/
    /// `object_removed`, stops schedule triggers, drains the flow-trigger
    /// queue (so no flow using these handles can still be in flight), then
    /// drops the subscription.
    async fn handle_bus_name_removed(&self, bus_name: &str) {
        let paths = {
            let mut subscriptions = self.subscriptions.lock().await;
            let Some(sub) = subscriptions.get_mut(bus_name) else { return };
            sub.state = Some(SubscriptionState::Draining);
            sub.path_objects.keys().cloned().collect::<Vec<_>>()
        };

        for path in &paths {
            for subscription_config in self.config.subscription_configs(bus_name, Some(path)) {
                self.fire_lifecycle_trigger(subscription_config, bus_name, path, "bus_name_removed").await;
                self.fire_lifecycle_trigger(subscription_config, bus_name, path, "object_removed").await;
                // Per spec.md DESIGN NOTES: stopped unconditionally, matching
                // the upstream TODO about reference-counting flow-sets.
                self.flow_sets.stop_flow_set(&subscription_config.flows);
            }
        }

        self.broker.flow_trigger.join().await;

        self.subscriptions.lock().await.remove(bus_name);
        log::info!("bus name removed: {bus_name}");
    }

    /// Handles one inbound broker command message: parses `method|property`
    /// and calls/sets it on every matching `(bus_name, path, interface)`.
    pub async fn handle_inbound_command(&self, msg: InboundBrokerMessage) {
        let Json::Object(payload) = &msg.payload else {
            log::warn!("{}: not a JSON object", msg.log_unmatched_hint);
            return;
        };

        let bus_name_filter = payload.get("bus_name").and_then(Json::as_str);
        let path_filter = payload.get("path").and_then(Json::as_str);

        let subscriptions = self.subscriptions.lock().await;
        let mut matched_any = false;

        for (bus_name, sub) in subscriptions.iter() {
            if let Some(pattern) = bus_name_filter {
                if !glob::Pattern::new(pattern).map(|p| p.matches(bus_name)).unwrap_or(bus_name == pattern) {
                    continue;
                }
            }
            for (path, interfaces) in &sub.path_objects {
                if let Some(pattern) = path_filter {
                    if !glob::Pattern::new(pattern).map(|p| p.matches(path)).unwrap_or(path == pattern) {
                        continue;
                    }
                }
                for interface_name in interfaces {
                    if let Some(interface_config) = self.find_interface_config(bus_name, path, interface_name) {
                        matched_any = true;
                        self.execute_command(bus_name, path, interface_config, payload).await;
                    }
                }
            }
        }
        drop(subscriptions);

        if !matched_any {
            log::debug!("{}", msg.log_unmatched_hint);
        }
    }

    fn find_interface_config(
        &self, bus_name: &str, path: &str, interface_name: &str,
    ) -> Option<crate::config::dbus::InterfaceConfig> {
        self.config.subscription_configs(bus_name, Some(path)).into_iter().find_map(|sub| {
            sub.interfaces.iter().find(|i| i.interface == interface_name).cloned()
        })
    }

    async fn execute_command(
        &self, bus_name: &str, path: &str, interface_config: crate::config::dbus::InterfaceConfig,
        payload: &serde_json::Map<String, Json>,
    ) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        if let Some(method) = payload.get("method").and_then(Json::as_str) {
            if !interface_config.has_method(method) {
                return;
            }
            let args = payload.get("args").cloned().unwrap_or(Json::Array(vec![]));
            let result = self.call_method(bus_name, path, &interface_config.interface, method, &args).await;
            self.publish_response(&interface_config, bus_name, path, &timestamp, "method", method, &args, result)
                .await;
        } else if let Some(property) = payload.get("property").and_then(Json::as_str) {
            if !interface_config.has_property(property) {
                return;
            }
            let value = payload.get("value").cloned().unwrap_or(Json::Null);
            let result = self.set_property(bus_name, path, &interface_config.interface, property, &value).await;
            let wrapped = Json::Array(vec![value.clone()]);
            self.publish_response(&interface_config, bus_name, path, &timestamp, "property", property, &wrapped, result)
                .await;
        }
    }

    /// Builds and sends a method call whose argument count and types are
    /// only known at runtime (from introspection), bypassing `Proxy`'s
    /// statically-typed `AppendAll` call path.
    async fn send_dynamic_call(
        &self, bus_name: &str, path: &str, interface: &str, method: &str, args: Vec<Box<dyn dbus::arg::RefArg>>,
    ) -> Result<Message> {
        use dbus::arg::IterAppend;
        use dbus::nonblock::NonblockReply;

        let mut msg = Message::new_method_call(bus_name, path, interface, method)
            .map_err(|e| Error::with_message(ErrorKind::Dbus, e))?;
        {
            let mut appender = IterAppend::new(&mut msg);
            for arg in &args {
                arg.append(&mut appender);
            }
        }

        let reply_future = self
            .connection
            .send_with_reply(msg, CALL_TIMEOUT)
            .map_err(|_| Error::with_message(ErrorKind::Dbus, "connection closed before call could be sent"))?;
        Ok(reply_future.await?)
    }

    async fn call_method(&self, bus_name: &str, path: &str, interface: &str, method: &str, args: &Json) -> Result<Json> {
        let node = self.introspect_path(bus_name, path).await?;
        let signature = node
            .interfaces
            .iter()
            .find(|i| i.name == interface)
            .and_then(|i| i.method(method))
            .map(|m| m.in_signature())
            .unwrap_or_default();
        let args_list = args.as_array().cloned().unwrap_or_default();
        let converted = dbus_value::convert_mqtt_args_to_dbus(&signature, &args_list)?;

        let reply = self.send_dynamic_call(bus_name, path, interface, method, converted).await?;
        let items = reply.get_items();
        Ok(Json::Array(items.iter().map(|i| dbus_value::unwrap_refarg(i.as_ref()).to_json()).collect()))
    }

    async fn set_property(&self, bus_name: &str, path: &str, interface: &str, property: &str, value: &Json) -> Result<Json> {
        let boxed = dbus_value::convert_mqtt_args_to_dbus("v", std::slice::from_ref(value))?;
        let wrapped_value = boxed.into_iter().next().expect("single converted value");
        self.send_dynamic_call(
            bus_name,
            path,
            "org.freedesktop.DBus.Properties",
            "Set",
            vec![
                Box::new(interface.to_string()),
                Box::new(property.to_string()),
                wrapped_value,
            ],
        )
        .await?;
        Ok(Json::Null)
    }

    /// `dbus_list` template global: well-known names of tracked bus-name
    /// subscriptions matching `name_pattern`.
    async fn dbus_list(&self, name_pattern: &str) -> Result<Vec<String>> {
        let pattern = glob::Pattern::new(name_pattern)
            .map_err(|e| Error::with_message(ErrorKind::Internal("invalid glob".into()), e.to_string()))?;
        let subscriptions = self.subscriptions.lock().await;
        Ok(subscriptions.keys().filter(|name| pattern.matches(name)).cloned().collect())
    }

    /// `dbus_call` template global.
    async fn dbus_call(&self, bus_name: &str, path: &str, interface: &str, method: &str, args: Json) -> Result<Json> {
        self.call_method(bus_name, path, interface, method, &args).await
    }

    /// `dbus_property_get` template global: falls back to
    /// `default_if_unsupported` rather than failing the render, since
    /// templates commonly probe properties that may not exist on every
    /// object matched by a glob subscription.
    async fn dbus_property_get(
        &self, bus_name: &str, path: &str, interface: &str, property: &str, default_if_unsupported: Json,
    ) -> Json {
        let reply = match self
            .send_dynamic_call(
                bus_name,
                path,
                "org.freedesktop.DBus.Properties",
                "Get",
                vec![Box::new(interface.to_string()), Box::new(property.to_string())],
            )
            .await
        {
            Ok(reply) => reply,
            Err(_) => return default_if_unsupported,
        };
        reply
            .get_items()
            .first()
            .map(|item| dbus_value::unwrap_refarg(item.as_ref()).to_json())
            .unwrap_or(default_if_unsupported)
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish_response(
        &self, interface_config: &crate::config::dbus::InterfaceConfig, bus_name: &str, path: &str,
        timestamp: &str, kind: &str, name: &str, args_or_value: &Json, result: Result<Json>,
    ) {
        let Some(response_topic_template) = &interface_config.mqtt_response_topic else { return };
        let ctx = serde_json::json!({"bus_name": bus_name, "path": path, "interface": interface_config.interface});
        let topic = match self
            .template
            .render_async(Template::from(response_topic_template.as_str()), ResultKind::String, ctx)
            .await
        {
            Ok(Json::String(s)) => s,
            _ => return,
        };

        let mut body = serde_json::Map::new();
        body.insert("bus_name".into(), Json::String(bus_name.to_string()));
        body.insert("path".into(), Json::String(path.to_string()));
        body.insert("interface".into(), Json::String(interface_config.interface.clone()));
        body.insert("timestamp".into(), Json::String(timestamp.to_string()));
        body.insert(kind.into(), Json::String(name.to_string()));
        body.insert(if kind == "method" { "args".into() } else { "value".into() }, args_or_value.clone());

        match result {
            Ok(value) => {
                body.insert("success".into(), Json::Bool(true));
                body.insert("result".into(), value);
            }
            Err(err) => {
                body.insert("success".into(), Json::Bool(false));
                body.insert("error".into(), Json::String(err.message.clone()));
                body.insert("error_type".into(), Json::String(format!("{:?}", err.kind)));
            }
        }

        let message = OutboundBrokerMessage {
            topic,
            payload: crate::broker::OutboundPayload::Json(Json::Object(body)),
        };
        if let Err(err) = self.broker.outbound_broker.send(message).await {
            log::warn!("outbound_broker queue closed: {err:?}");
        }
    }
}

/// Serves `dbus_*` template-global requests by delegating to the shared Bus
/// Client. Runs until the request channel closes (template engine dropped).
pub async fn run_bus_function_server(
    client: Arc<BusClient>, mut requests: mpsc::Receiver<crate::template::functions::BusFunctionRequest>,
) {
    use crate::template::functions::BusFunctionRequest;

    while let Some(request) = requests.recv().await {
        match request {
            BusFunctionRequest::List { name_pattern, reply } => {
                let _ = reply.send(client.dbus_list(&name_pattern).await);
            }
            BusFunctionRequest::Call { bus_name, path, interface, method, args, reply } => {
                let _ = reply.send(client.dbus_call(&bus_name, &path, &interface, &method, args).await);
            }
            BusFunctionRequest::PropertyGet { bus_name, path, interface, property, default_if_unsupported, reply } => {
                let value =
                    client.dbus_property_get(&bus_name, &path, &interface, &property, default_if_unsupported).await;
                let _ = reply.send(Ok(value));
            }
        }
    }
}

/// Dedicated worker consuming the bus-signal queue: evaluates each signal's
/// configured filter, and on match enqueues a `dbus_signal` flow trigger.
/// Runs until the queue closes.
pub async fn run_signal_processor(
    config: DbusConfig, template: Arc<TemplateEngine>, mut bus_signal_rx: crate::queue::Receiver<BusSignalEvent>,
    flow_trigger_tx: crate::queue::Sender<FlowTriggerMessage>,
) {
    while let Some(event) = bus_signal_rx.recv().await {
        if let Err(err) = process_signal_event(&config, &template, &flow_trigger_tx, &event).await {
            log::warn!("signal processing failed for {}.{}: {err}", event.interface, event.signal);
        }
        bus_signal_rx.task_done().await;
    }
}

async fn process_signal_event(
    config: &DbusConfig, template: &Arc<TemplateEngine>, flow_trigger_tx: &crate::queue::Sender<FlowTriggerMessage>,
    event: &BusSignalEvent,
) -> Result<()> {
    let args_json: Json = Json::Array(event.args.iter().map(Value::to_json).collect());
    let filter_ctx = serde_json::json!({"args": args_json});

    for subscription_config in config.subscription_configs(&event.bus_name, Some(&event.path)) {
        let Some(interface_config) =
            subscription_config.interfaces.iter().find(|i| i.interface == event.interface)
        else {
            continue;
        };
        let Some(signal_config) = interface_config.signal(&event.signal) else { continue };

        if let Some(filter) = &signal_config.filter {
            let matched =
                template.render_async(Template::from(filter.as_str()), ResultKind::Bool, filter_ctx.clone()).await?;
            if matched != Json::Bool(true) {
                continue;
            }
        }

        for flow in &subscription_config.flows {
            for trigger in &flow.triggers {
                let FlowTriggerConfig::DbusSignal { interface, signal, bus_name, path } = trigger else { continue };
                if interface != &event.interface || signal != &event.signal {
                    continue;
                }
                if let Some(pattern) = bus_name {
                    if !glob::Pattern::new(pattern).map(|p| p.matches(&event.bus_name)).unwrap_or(false) {
                        continue;
                    }
                }
                if let Some(pattern) = path {
                    if !glob::Pattern::new(pattern).map(|p| p.matches(&event.path)).unwrap_or(false) {
                        continue;
                    }
                }

                let context = serde_json::json!({
                    "bus_name": event.bus_name,
                    "path": event.path,
                    "interface": event.interface,
                    "signal": event.signal,
                    "args": args_json,
                });
                let message = FlowTriggerMessage { flow_id: flow.id.clone(), trigger_kind: "dbus_signal", context };
                flow_trigger_tx
                    .send(message)
                    .await
                    .map_err(|_| Error::with_message(ErrorKind::Internal("flow_trigger queue closed".into()), ""))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dbus::{BusType, InterfaceConfig, SubscriptionConfig};
    use crate::config::flow::{FlowConfig, FlowTriggerConfig};

    fn dbus_config_with_signal(filter: Option<&str>) -> DbusConfig {
        DbusConfig {
            bus_type: BusType::Session,
            subscriptions: vec![SubscriptionConfig {
                bus_name: "org.mpris.MediaPlayer2.*".into(),
                path: "/org/mpris/MediaPlayer2".into(),
                interfaces: vec![InterfaceConfig {
                    interface: "org.mpris.MediaPlayer2.Player".into(),
                    mqtt_command_topic: None,
                    mqtt_response_topic: None,
                    signals: vec![crate::config::dbus::SignalConfig { signal: "Seeked".into(), filter: filter.map(str::to_string) }],
                    methods: vec![],
                    properties: vec![],
                }],
                flows: vec![FlowConfig {
                    id: "flow-1".into(),
                    name: None,
                    triggers: vec![FlowTriggerConfig::DbusSignal {
                        interface: "org.mpris.MediaPlayer2.Player".into(),
                        signal: "Seeked".into(),
                        bus_name: None,
                        path: None,
                    }],
                    actions: vec![],
                }],
                id: "sub-1".into(),
            }],
        }
    }

    fn seeked_event() -> BusSignalEvent {
        BusSignalEvent {
            bus_name: "org.mpris.MediaPlayer2.vlc".into(),
            path: "/org/mpris/MediaPlayer2".into(),
            interface: "org.mpris.MediaPlayer2.Player".into(),
            signal: "Seeked".into(),
            args: vec![Value::Int(4200)],
        }
    }

    #[tokio::test]
    async fn matching_signal_produces_flow_trigger() {
        let config = dbus_config_with_signal(None);
        let template = Arc::new(TemplateEngine::new());
        let (tx, mut rx) = crate::queue::bounded(4);

        process_signal_event(&config, &template, &tx, &seeked_event()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.flow_id, "flow-1");
        assert_eq!(msg.trigger_kind, "dbus_signal");
    }

    #[tokio::test]
    async fn unconfigured_signal_is_silently_skipped() {
        let config = dbus_config_with_signal(None);
        let template = Arc::new(TemplateEngine::new());
        let (tx, _rx) = crate::queue::bounded(4);

        let mut event = seeked_event();
        event.signal = "PlaybackStatusChanged".into();

        process_signal_event(&config, &template, &tx, &event).await.unwrap();
    }

    #[tokio::test]
    async fn filter_expression_suppresses_trigger_when_false() {
        let config = dbus_config_with_signal(Some("{{ args[0] > 10000 }}"));
        let template = Arc::new(TemplateEngine::new());
        let (tx, mut rx) = crate::queue::bounded(4);

        process_signal_event(&config, &template, &tx, &seeked_event()).await.unwrap();
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn filter_expression_allows_trigger_when_true() {
        let config = dbus_config_with_signal(Some("{{ args[0] < 10000 }}"));
        let template = Arc::new(TemplateEngine::new());
        let (tx, mut rx) = crate::queue::bounded(4);

        process_signal_event(&config, &template, &tx, &seeked_event()).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn bus_name_subscription_state_transitions_through_lifecycle() {
        let mut sub = BusNameSubscription::default();
        assert_eq!(sub.state, None);
        sub.state = Some(SubscriptionState::Discovered);
        assert_eq!(sub.state, Some(SubscriptionState::Discovered));
        sub.state = Some(SubscriptionState::Watched);
        assert_eq!(sub.state, Some(SubscriptionState::Watched));
        sub.state = Some(SubscriptionState::Draining);
        assert_eq!(sub.state, Some(SubscriptionState::Draining));
    }
}
