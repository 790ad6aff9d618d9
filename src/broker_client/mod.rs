//! Broker Client: the MQTT-side half of the bridge. Owns one logical
//! connection, tagged with a unique client id used for loopback suppression
//! across multi-instance deployments, and drains/fills the outbound and
//! inbound queues.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties, SubscribeFilter};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use serde_json::Value as Json;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::broker::{EventBroker, FlowTriggerMessage, InboundBrokerMessage, OutboundBrokerMessage, OutboundPayload};
use crate::config::flow::{FlowConfig, FlowTriggerConfig};
use crate::config::mqtt::MqttConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::template::{ResultKind, Template, TemplateEngine};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(1000);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Shared by every instance of this bridge, regardless of process. Loopback
/// suppression keys off this prefix, not the per-process client id, so that
/// several cooperating instances never re-process each other's publishes.
const CLIENT_ID_PREFIX: &str = "dbus2mqtt-";

/// Connects to the broker, tags outbound publishes with a per-process
/// client id, and routes inbound messages to the flow-trigger and inbound
/// command queues.
pub struct BrokerClient {
    client: AsyncClient,
    client_id: String,
    flows: Vec<FlowConfig>,
    template: Arc<TemplateEngine>,
    broker: EventBroker,
    connected: Notify,
}

impl BrokerClient {
    /// Opens the connection and subscribes to the configured topic list
    /// with the no-local option, so this process never receives its own
    /// publishes back from the broker. Returns the client handle plus its
    /// event loop, which must be driven by [`Self::run_event_loop`].
    pub async fn connect(
        config: &MqttConfig, flows: Vec<FlowConfig>, template: Arc<TemplateEngine>, broker: EventBroker,
    ) -> Result<(Arc<Self>, EventLoop)> {
        let client_id = format!("{CLIENT_ID_PREFIX}{}", uuid::Uuid::new_v4());

        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);

        let filters: Vec<SubscribeFilter> = config
            .subscription_topics
            .iter()
            .map(|topic| SubscribeFilter { path: topic.clone(), qos: QoS::AtLeastOnce, nolocal: true, ..Default::default() })
            .collect();
        client
            .subscribe_many(filters)
            .await
            .map_err(|err| Error::with_message(ErrorKind::Mqtt, err.to_string()))?;

        let this = Arc::new(Self { client, client_id, flows, template, broker, connected: Notify::new() });
        Ok((this, eventloop))
    }

    /// Drives the broker connection. Runs until the event loop itself
    /// returns a fatal error (connection closed and not retrying); transient
    /// poll errors are logged and retried after a short delay.
    pub async fn run_event_loop(self: Arc<Self>, mut eventloop: EventLoop) {
        log::trace!("Starting event loop for broker client");
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    log::info!("connected to broker as {}", self.client_id);
                    self.connected.notify_waiters();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.handle_incoming_publish(publish).await;
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("broker connection error: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn handle_incoming_publish(&self, publish: Publish) {
        if publish.retain {
            return;
        }

        let own_publish = publish
            .properties
            .as_ref()
            .and_then(|p| p.user_properties.iter().find(|(k, _)| k == "client_id"))
            .is_some_and(|(_, v)| v.starts_with(CLIENT_ID_PREFIX));
        if own_publish {
            return;
        }

        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        let payload: Json = if publish.payload.is_empty() {
            Json::Object(serde_json::Map::new())
        } else {
            serde_json::from_slice(&publish.payload).unwrap_or_else(|_| Json::Object(serde_json::Map::new()))
        };

        self.dispatch_mqtt_message_triggers(&topic, &payload).await;

        let message = InboundBrokerMessage {
            topic: topic.clone(),
            payload,
            log_unmatched_hint: format!("no flow triggered for inbound message on {topic}"),
        };
        if let Err(err) = self.broker.inbound_broker.send(message).await {
            log::warn!("inbound_broker queue closed: {err:?}");
        }
    }

    async fn dispatch_mqtt_message_triggers(&self, topic: &str, payload: &Json) {
        for flow in &self.flows {
            for trigger in &flow.triggers {
                let FlowTriggerConfig::MqttMessage { topic: trigger_topic, filter } = trigger else { continue };
                if trigger_topic != topic {
                    continue;
                }

                if let Some(filter) = filter {
                    let ctx = serde_json::json!({"topic": topic, "payload": payload});
                    match self.template.render_async(Template::from(filter.as_str()), ResultKind::Bool, ctx).await {
                        Ok(Json::Bool(true)) => {}
                        Ok(_) => continue,
                        Err(err) => {
                            log::warn!("mqtt_message filter failed for flow {}: {err}", flow.id);
                            continue;
                        }
                    }
                }

                let message = FlowTriggerMessage {
                    flow_id: flow.id.clone(),
                    trigger_kind: "mqtt_message",
                    context: serde_json::json!({"topic": topic, "payload": payload}),
                };
                if let Err(err) = self.broker.flow_trigger.send(message).await {
                    log::warn!("flow_trigger queue closed: {err:?}");
                }
            }
        }
    }

    /// Drains the outbound queue and publishes each message, serialized per
    /// its payload type. The first publish waits for the connection to be
    /// established, capped at `CONNECT_TIMEOUT`.
    pub async fn run_outbound(self: Arc<Self>, mut outbound_rx: crate::queue::Receiver<OutboundBrokerMessage>) {
        log::trace!("Starting outbound publish loop for broker client");
        let mut first_publish = true;

        while let Some(message) = outbound_rx.recv().await {
            if first_publish {
                if timeout(CONNECT_TIMEOUT, self.connected.notified()).await.is_err() {
                    log::warn!("timed out waiting for broker connection before first publish");
                }
                first_publish = false;
            }

            if let Err(err) = self.publish_one(&message).await {
                log::warn!("publish to {} failed: {err}", message.topic);
            }
            outbound_rx.task_done().await;
        }

        log::trace!("Terminated outbound publish loop for broker client");
    }

    async fn publish_one(&self, message: &OutboundBrokerMessage) -> Result<()> {
        let payload = self.serialize(&message.payload).await;
        let properties =
            PublishProperties { user_properties: vec![("client_id".to_string(), self.client_id.clone())], ..Default::default() };

        timeout(
            PUBLISH_ACK_TIMEOUT,
            self.client.publish_with_properties(message.topic.clone(), QoS::AtLeastOnce, false, payload, properties),
        )
        .await
        .map_err(|_| Error::with_message(ErrorKind::Mqtt, "publish ack timed out"))?
        .map_err(|err| Error::with_message(ErrorKind::Mqtt, err.to_string()))?;

        Ok(())
    }

    async fn serialize(&self, payload: &OutboundPayload) -> Vec<u8> {
        match payload {
            OutboundPayload::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
            OutboundPayload::Yaml(v) => serde_yaml::to_string(v).unwrap_or_default().into_bytes(),
            OutboundPayload::Text(s) => s.clone().into_bytes(),
            OutboundPayload::BinaryUri(uri) => self.read_binary_uri(uri).await,
        }
    }

    async fn read_binary_uri(&self, uri: &str) -> Vec<u8> {
        let Ok(url) = url::Url::parse(uri) else { return Vec::new() };
        if url.scheme() != "file" {
            return Vec::new();
        }
        let Ok(path) = url.to_file_path() else { return Vec::new() };
        tokio::fs::read(&path).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flows_with_mqtt_trigger(topic: &str, filter: Option<&str>) -> Vec<FlowConfig> {
        vec![FlowConfig {
            id: "flow-1".into(),
            name: None,
            triggers: vec![FlowTriggerConfig::MqttMessage { topic: topic.to_string(), filter: filter.map(str::to_string) }],
            actions: vec![],
        }]
    }

    fn client(flows: Vec<FlowConfig>, broker: EventBroker) -> BrokerClient {
        let (client, _eventloop) =
            AsyncClient::new(MqttOptions::new("test-client", "localhost", 1883), 8);
        BrokerClient {
            client,
            client_id: "test-client".into(),
            flows,
            template: Arc::new(TemplateEngine::new()),
            broker,
            connected: Notify::new(),
        }
    }

    #[tokio::test]
    async fn matching_topic_without_filter_enqueues_trigger() {
        let (broker, mut queues) = EventBroker::new(4);
        let bc = client(flows_with_mqtt_trigger("dbus2mqtt/test", None), broker);

        bc.dispatch_mqtt_message_triggers("dbus2mqtt/test", &serde_json::json!({"k": "v"})).await;

        let msg = queues.flow_trigger.recv().await.unwrap();
        assert_eq!(msg.flow_id, "flow-1");
        assert_eq!(msg.trigger_kind, "mqtt_message");
    }

    #[tokio::test]
    async fn non_matching_topic_is_ignored() {
        let (broker, mut queues) = EventBroker::new(4);
        let bc = client(flows_with_mqtt_trigger("dbus2mqtt/test", None), broker);

        bc.dispatch_mqtt_message_triggers("dbus2mqtt/other", &serde_json::json!({})).await;

        drop(bc);
        assert_eq!(queues.flow_trigger.recv().await, None);
    }

    #[tokio::test]
    async fn filter_suppresses_trigger_when_false() {
        let (broker, mut queues) = EventBroker::new(4);
        let bc = client(flows_with_mqtt_trigger("dbus2mqtt/test", Some("{{ payload.ok == true }}")), broker);

        bc.dispatch_mqtt_message_triggers("dbus2mqtt/test", &serde_json::json!({"ok": false})).await;

        drop(bc);
        assert_eq!(queues.flow_trigger.recv().await, None);
    }

    #[tokio::test]
    async fn text_payload_serializes_verbatim() {
        let (broker, _queues) = EventBroker::new(4);
        let bc = client(vec![], broker);
        let bytes = bc.serialize(&OutboundPayload::Text("hello".into())).await;
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn binary_uri_with_non_file_scheme_yields_empty_payload() {
        let (broker, _queues) = EventBroker::new(4);
        let bc = client(vec![], broker);
        let bytes = bc.serialize(&OutboundPayload::BinaryUri("http://example.com/x".into())).await;
        assert!(bytes.is_empty());
    }
}
