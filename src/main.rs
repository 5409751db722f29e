use mqtt_hub_bridge::config::Config;
use mqtt_hub_bridge::gateway::GatewayRegistry;
use mqtt_hub_bridge::hub::HubClient;
use mqtt_hub_bridge::hub_transport::WsHubTransport;
use mqtt_hub_bridge::mqtt_service::{MqttConfig, RumqttTransport};
use mqtt_hub_bridge::service_utils::{
    handle_shutdown, start_forwarder, start_hub_service, start_logging, start_mqtt_session,
    start_mqtt_supervisor,
};
use mqtt_hub_bridge::MqttBridge;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Readings waiting for the hub; beyond this the MQTT side drops them.
const READING_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    start_logging(config.log_level);

    let client_id = config.client_id();
    info!("Start {} {}...", client_id, env!("CARGO_PKG_VERSION"));

    let registry = match GatewayRegistry::load(&config.config_file) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Error loading gateways: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mqtt_config = MqttConfig {
        mqtt_host: config.mqtt_host.clone(),
        mqtt_port: config.mqtt_port,
        keepalive: std::time::Duration::from_secs(config.mqtt_keepalive_secs),
        client_id,
        request_capacity: (registry.len() * 2).max(64),
    };
    let (mqtt_transport, session) = match RumqttTransport::connect(&mqtt_config).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("MQTT: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mqtt_transport = Arc::new(mqtt_transport);

    let (readings_tx, readings_rx) = mpsc::channel(READING_QUEUE);
    let bridge = match MqttBridge::new(registry.clone(), mqtt_transport.clone(), readings_tx) {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            error!("Error building topic matchers: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let hub_transport = Arc::new(WsHubTransport::new(
        config.hub_url(),
        config.hub_reconnect_wait(),
    ));
    let hub_client = Arc::new(HubClient::new(
        registry.clone(),
        hub_transport.clone(),
        bridge.clone(),
    ));

    let cancel = CancellationToken::new();
    let tasks = vec![
        start_mqtt_session(
            session,
            bridge.clone(),
            config.mqtt_reconnect_wait(),
            cancel.clone(),
        ),
        start_mqtt_supervisor(
            bridge.clone(),
            config.poll_interval(),
            config.mqtt_reconnect_wait(),
            cancel.clone(),
        ),
        start_hub_service(hub_transport, hub_client.clone(), cancel.clone()),
        start_forwarder(hub_client, readings_rx, cancel.clone()),
    ];

    handle_shutdown(cancel).await;

    mqtt_transport.disconnect();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Task ended abnormally: {:?}", e);
        }
    }

    let stats = bridge.stats();
    info!(
        connects = stats.connects,
        messages = stats.messages_received,
        forwarded = stats.readings_forwarded,
        dropped = stats.messages_dropped,
        publishes = stats.publishes,
        sent = stats.publishes_sent,
        "All services shut down successfully."
    );

    ExitCode::SUCCESS
}
