//! Event Broker: the four bounded queues linking the Bus Client, Broker
//! Client, Flow Scheduler and Flow Processor.

use serde_json::Value as Json;

use crate::config::flow::PayloadType;
use crate::queue::{self, Receiver, Sender};
use crate::value::Value;

/// A message received from the broker, destined for the Bus Client's
/// method/property command handling.
#[derive(Debug, Clone)]
pub struct InboundBrokerMessage {
    pub topic: String,
    pub payload: Json,
    /// Logged by the consumer if nothing claims this message.
    pub log_unmatched_hint: String,
}

/// The rendered payload of an outbound publish, already shaped per its
/// `payload_type`.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Json(Json),
    Yaml(Json),
    Text(String),
    /// A `file://` URI whose bytes are read by the Broker Client at publish
    /// time.
    BinaryUri(String),
}

impl OutboundPayload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            OutboundPayload::Json(_) => PayloadType::Json,
            OutboundPayload::Yaml(_) => PayloadType::Yaml,
            OutboundPayload::Text(_) => PayloadType::Text,
            OutboundPayload::BinaryUri(_) => PayloadType::Binary,
        }
    }
}

/// A message queued for publication on the broker.
#[derive(Debug, Clone)]
pub struct OutboundBrokerMessage {
    pub topic: String,
    pub payload: OutboundPayload,
}

/// A bus signal delivery, carrying enough context to evaluate its filter
/// and, on match, to build a `dbus_signal` flow trigger.
#[derive(Debug, Clone)]
pub struct BusSignalEvent {
    pub bus_name: String,
    pub path: String,
    pub interface: String,
    pub signal: String,
    pub args: Vec<Value>,
}

/// A flow trigger ready for the Flow Processor: which flow fired, and the
/// context to seed the execution's local scope with.
#[derive(Debug, Clone)]
pub struct FlowTriggerMessage {
    pub flow_id: String,
    pub trigger_kind: &'static str,
    pub context: Json,
}

/// Producer handles for the four queues, cloned freely into the Bus
/// Client, Broker Client and Flow Scheduler.
#[derive(Clone)]
pub struct EventBroker {
    pub inbound_broker: Sender<InboundBrokerMessage>,
    pub outbound_broker: Sender<OutboundBrokerMessage>,
    pub bus_signal: Sender<BusSignalEvent>,
    pub flow_trigger: Sender<FlowTriggerMessage>,
}

/// Consumer handles, taken once by the worker that owns each queue.
pub struct EventQueues {
    pub inbound_broker: Receiver<InboundBrokerMessage>,
    pub outbound_broker: Receiver<OutboundBrokerMessage>,
    pub bus_signal: Receiver<BusSignalEvent>,
    pub flow_trigger: Receiver<FlowTriggerMessage>,
}

/// Default per-queue capacity. Queues are bounded so a slow consumer
/// applies backpressure rather than growing memory unboundedly.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

impl EventBroker {
    pub fn new(capacity: usize) -> (Self, EventQueues) {
        let (inbound_tx, inbound_rx) = queue::bounded(capacity);
        let (outbound_tx, outbound_rx) = queue::bounded(capacity);
        let (signal_tx, signal_rx) = queue::bounded(capacity);
        let (trigger_tx, trigger_rx) = queue::bounded(capacity);
        (
            Self {
                inbound_broker: inbound_tx,
                outbound_broker: outbound_tx,
                bus_signal: signal_tx,
                flow_trigger: trigger_tx,
            },
            EventQueues {
                inbound_broker: inbound_rx,
                outbound_broker: outbound_rx,
                bus_signal: signal_rx,
                flow_trigger: trigger_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flow_trigger_round_trips_through_queue() {
        let (broker, mut queues) = EventBroker::new(4);
        broker
            .flow_trigger
            .send(FlowTriggerMessage {
                flow_id: "flow-1".into(),
                trigger_kind: "schedule",
                context: serde_json::json!({}),
            })
            .await
            .unwrap();
        let msg = queues.flow_trigger.recv().await.unwrap();
        assert_eq!(msg.flow_id, "flow-1");
        queues.flow_trigger.task_done().await;
    }
}
