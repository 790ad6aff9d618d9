//! `dbus2mqtt`: a configurable bridge between a D-Bus style object broker
//! and an MQTT style publish/subscribe fabric.

mod broker;
mod broker_client;
mod bus;
mod config;
mod context;
mod error;
mod flow;
mod queue;
mod scheduler;
mod template;
mod value;

use std::sync::Arc;

use clap::Parser;
use dbus::nonblock::SyncConnection;
use dbus_tokio::connection;
use tokio::task::spawn_blocking;

use broker::{EventBroker, DEFAULT_QUEUE_CAPACITY};
use broker_client::BrokerClient;
use bus::BusClient;
use config::dbus::BusType;
use config::Config;
use context::GlobalContext;
use error::Result;
use flow::FlowProcessor;
use scheduler::FlowScheduler;
use template::functions::BusFunctionsHandle;
use template::TemplateEngine;

#[derive(Parser, Debug)]
#[command(name = "dbus2mqtt")]
struct Opts {
    /// Enable debug-level logging for this process's own target.
    #[arg(short, long)]
    verbose: bool,

    /// Path to a YAML config file. May be given more than once; later files
    /// override earlier ones at the top-level key.
    #[arg(long = "config", default_value = "./config.yaml")]
    config: Vec<String>,
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}

async fn connect(bus_type: BusType) -> Result<(Arc<SyncConnection>, tokio::task::JoinHandle<()>)> {
    let (resource, conn) = match bus_type {
        BusType::Session => spawn_blocking(connection::new_session_sync).await??,
        BusType::System => spawn_blocking(connection::new_system_sync).await??,
    };
    let dbus_task = tokio::spawn(async move {
        if let Err(err) = resource.await {
            log::error!("lost connection to the bus: {err}");
        }
    });
    Ok((conn, dbus_task))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let opt = Opts::parse();

    if opt.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("dbus2mqtt=debug,info")).init();
    } else {
        env_logger::init();
    }

    let config = Config::load(&opt.config)?;
    let (connection, dbus_task) = connect(config.dbus.bus_type).await?;

    let (event_broker, mut queues) = EventBroker::new(DEFAULT_QUEUE_CAPACITY);
    let mut template_engine = TemplateEngine::new();

    let (bus_function_tx, bus_function_rx) = tokio::sync::mpsc::channel(32);
    template_engine.register_bus_functions(BusFunctionsHandle::new(bus_function_tx));
    let template_engine = Arc::new(template_engine);

    let scheduler = Arc::new(FlowScheduler::new(event_broker.clone()));
    let bus_client = Arc::new(BusClient::new(
        connection,
        config.dbus.clone(),
        event_broker.clone(),
        template_engine.clone(),
        scheduler.clone(),
    ));

    let (mqtt_client, mqtt_eventloop) =
        BrokerClient::connect(&config.mqtt, config.flows.clone(), template_engine.clone(), event_broker.clone()).await?;

    let global_context = GlobalContext::new();
    let flow_processor =
        FlowProcessor::new(&config.flows, &config.dbus, global_context, template_engine.clone(), event_broker.clone());

    let bus_run = tokio::spawn({
        let bus_client = bus_client.clone();
        async move {
            if let Err(err) = bus_client.run().await {
                log::error!("bus client event loop exited: {err}");
            }
        }
    });
    let bus_function_server = tokio::spawn(bus::run_bus_function_server(bus_client.clone(), bus_function_rx));
    let signal_processor = tokio::spawn(bus::run_signal_processor(
        config.dbus.clone(),
        template_engine.clone(),
        queues.bus_signal,
        event_broker.flow_trigger.clone(),
    ));
    let mqtt_event_loop = tokio::spawn(mqtt_client.clone().run_event_loop(mqtt_eventloop));
    let mqtt_outbound = tokio::spawn(mqtt_client.run_outbound(queues.outbound_broker));
    let inbound_commands = tokio::spawn({
        let bus_client = bus_client.clone();
        async move {
            while let Some(message) = queues.inbound_broker.recv().await {
                bus_client.handle_inbound_command(message).await;
                queues.inbound_broker.task_done().await;
            }
        }
    });
    let flow_run = tokio::spawn(flow_processor.run(queues.flow_trigger));

    wait_for_shutdown_signal().await;
    log::info!("shutting down");

    for task in [bus_run, bus_function_server, signal_processor, mqtt_event_loop, mqtt_outbound, inbound_commands, flow_run] {
        task.abort();
    }
    dbus_task.abort();

    Ok(())
}
