use crate::bridge::MqttBridge;
use crate::hub::HubClient;
use crate::hub_transport::WsHubTransport;
use crate::mqtt_service::MqttSession;
use crate::translate::SensorReading;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

/// Initialize the global tracing subscriber.
pub fn start_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .init();
}

/// Drive the MQTT event loop
pub fn start_mqtt_session(
    session: MqttSession,
    bridge: Arc<MqttBridge>,
    reconnect_wait: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        session.run(bridge, reconnect_wait, cancel).await;
    })
}

/// Watch the MQTT connection state
pub fn start_mqtt_supervisor(
    bridge: Arc<MqttBridge>,
    poll_interval: Duration,
    reconnect_wait: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        bridge.supervise(poll_interval, reconnect_wait, cancel).await;
    })
}

/// Run the hub connection
pub fn start_hub_service(
    transport: Arc<WsHubTransport>,
    client: Arc<HubClient>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        transport.run(client, cancel).await;
    })
}

/// Forward sensor readings from MQTT to the hub
pub fn start_forwarder(
    client: Arc<HubClient>,
    readings: mpsc::Receiver<SensorReading>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        client.forward_readings(readings, cancel).await;
    })
}

/// Wait for Ctrl-C (or an earlier cancellation) and cancel every task.
pub async fn handle_shutdown(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to handle termination signal: {:?}", e);
            }
            info!("Bridge is shutting down...");
        }
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_shutdown_returns_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle_shutdown(cancel.clone()))
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
    }
}
