//! Flow actions: `mqtt_publish`, `context_set`, `log`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::broker::{EventBroker, OutboundBrokerMessage, OutboundPayload};
use crate::config::flow::{FlowActionConfig, PayloadType};
use crate::context::ExecutionContext;
use crate::error::{Error, ErrorKind, Result};
use crate::template::{ResultKind, Template, TemplateEngine};

fn yaml_to_json(value: &serde_yaml::Value) -> Result<Json> {
    serde_json::to_value(value).map_err(|e| Error::with_message(ErrorKind::Template, e.to_string()))
}

/// Runs one action against `ctx`, which is mutated in place by
/// `context_set` (local scope) and, through its global handle, by
/// `context_set`'s `global_context`. Rendering goes through
/// [`TemplateEngine::render_async`] since any action's template may call a
/// `dbus_*` global.
pub async fn execute_action(
    action: &FlowActionConfig, ctx: &mut ExecutionContext, template: &Arc<TemplateEngine>, broker: &EventBroker,
) -> Result<()> {
    match action {
        FlowActionConfig::MqttPublish { topic_template, payload_template, payload_type } => {
            mqtt_publish(topic_template, payload_template, *payload_type, ctx, template, broker).await
        }
        FlowActionConfig::ContextSet { global_context, context } => {
            context_set(global_context, context, ctx, template).await
        }
        FlowActionConfig::Log { message_template, level } => log_action(message_template, level, ctx, template).await,
    }
}

async fn mqtt_publish(
    topic_template: &str, payload_template: &serde_yaml::Value, payload_type: PayloadType,
    ctx: &ExecutionContext, template: &Arc<TemplateEngine>, broker: &EventBroker,
) -> Result<()> {
    let aggregated = Json::Object(ctx.aggregated().into_iter().collect());

    let topic = match template.render_async(Template::from(topic_template), ResultKind::String, aggregated.clone()).await? {
        Json::String(s) => s,
        other => return Err(Error::with_message(ErrorKind::Template, format!("topic did not render to a string: {other}"))),
    };

    let payload_json = yaml_to_json(payload_template)?;
    let payload = match payload_type {
        PayloadType::Json => OutboundPayload::Json(
            template.render_async(Template::from(payload_json), ResultKind::Dict, aggregated.clone()).await?,
        ),
        PayloadType::Yaml => OutboundPayload::Yaml(
            template.render_async(Template::from(payload_json), ResultKind::Dict, aggregated.clone()).await?,
        ),
        PayloadType::Text => {
            let rendered =
                template.render_async(Template::from(payload_json), ResultKind::String, aggregated.clone()).await?;
            OutboundPayload::Text(match rendered {
                Json::String(s) => s,
                other => other.to_string(),
            })
        }
        PayloadType::Binary => {
            let rendered = template.render_async(Template::from(payload_json), ResultKind::String, aggregated).await?;
            OutboundPayload::BinaryUri(match rendered {
                Json::String(s) => s,
                other => other.to_string(),
            })
        }
    };

    broker
        .outbound_broker
        .send(OutboundBrokerMessage { topic, payload })
        .await
        .map_err(|_| Error::with_message(ErrorKind::Internal("outbound_broker queue closed".into()), ""))
}

async fn render_yaml_map(
    map: &HashMap<String, serde_yaml::Value>, ctx: &ExecutionContext, template: &Arc<TemplateEngine>,
) -> Result<HashMap<String, Json>> {
    let aggregated = Json::Object(ctx.aggregated().into_iter().collect());
    let mut rendered = HashMap::with_capacity(map.len());
    for (key, value) in map {
        let json_value = yaml_to_json(value)?;
        let out = template.render_async(Template::from(json_value), ResultKind::Any, aggregated.clone()).await?;
        rendered.insert(key.clone(), out);
    }
    Ok(rendered)
}

async fn context_set(
    global_context: &HashMap<String, serde_yaml::Value>, context: &HashMap<String, serde_yaml::Value>,
    ctx: &mut ExecutionContext, template: &Arc<TemplateEngine>,
) -> Result<()> {
    if !global_context.is_empty() {
        let rendered = render_yaml_map(global_context, ctx, template).await?;
        ctx.global().merge(rendered);
    }
    if !context.is_empty() {
        let rendered = render_yaml_map(context, ctx, template).await?;
        for (key, value) in rendered {
            ctx.set_local(key, value);
        }
    }
    Ok(())
}

async fn log_action(
    message_template: &str, level: &str, ctx: &ExecutionContext, template: &Arc<TemplateEngine>,
) -> Result<()> {
    let aggregated = Json::Object(ctx.aggregated().into_iter().collect());
    let message = match template.render_async(Template::from(message_template), ResultKind::String, aggregated).await? {
        Json::String(s) => s,
        other => other.to_string(),
    };

    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => log::debug!("[{}] {message}", ctx.name),
        "WARN" | "WARNING" => log::warn!("[{}] {message}", ctx.name),
        "ERROR" => log::error!("[{}] {message}", ctx.name),
        "TRACE" => log::trace!("[{}] {message}", ctx.name),
        _ => log::info!("[{}] {message}", ctx.name),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FlowContext, GlobalContext};

    fn engine() -> Arc<TemplateEngine> {
        Arc::new(TemplateEngine::new())
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("flow-1", GlobalContext::new(), FlowContext::empty())
    }

    #[tokio::test]
    async fn mqtt_publish_renders_json_payload() {
        let (broker, mut queues) = EventBroker::new(4);
        let template = engine();
        let mut execution = ctx();
        execution.set_local("value", Json::String("test-value".into()));

        let payload_template: serde_yaml::Value =
            serde_yaml::from_str("test-key: '{{ value }}'").unwrap();
        mqtt_publish("dbus2mqtt/test", &payload_template, PayloadType::Json, &execution, &template, &broker)
            .await
            .unwrap();

        let msg = queues.outbound_broker.recv().await.unwrap();
        assert_eq!(msg.topic, "dbus2mqtt/test");
        match msg.payload {
            OutboundPayload::Json(v) => assert_eq!(v["test-key"], Json::String("test-value".into())),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn context_set_merges_global_and_local() {
        let template = engine();
        let mut execution = ExecutionContext::new(
            "flow-1",
            GlobalContext::new(),
            FlowContext::for_subscription("test.bus_name.*", "/path", &["iface".to_string()]),
        );

        let mut global_context = HashMap::new();
        global_context.insert("var1".to_string(), serde_yaml::Value::String("{{ subscription_bus_name }}".into()));

        context_set(&global_context, &HashMap::new(), &mut execution, &template).await.unwrap();

        assert_eq!(execution.global().snapshot().get("var1").unwrap(), "test.bus_name.*");
    }

    #[tokio::test]
    async fn log_action_falls_back_to_info_for_unknown_level() {
        let template = engine();
        let execution = ctx();
        log_action("hello", "CATASTROPHIC", &execution, &template).await.unwrap();
    }
}
