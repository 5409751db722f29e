use crate::bridge::MqttBridge;
use crate::gateway::GatewayRegistry;
use crate::transport::{AtomicClientState, ClientState, HubEventHandler, HubTransport, TransportError};
use crate::translate::{build_publish, SensorReading};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event carrying sensor readings to the hub.
pub const SENSOR_EVENT: &str = "sensor_addr_response";
/// Event carrying actuator writes from the hub.
pub const ACTUATOR_EVENT: &str = "actuator_addr_response";

/// Actuator write addressed to a gateway node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActuatorWrite {
    pub gateway: String,
    #[serde(alias = "node_address")]
    pub node_addr: String,
    #[serde(alias = "fields")]
    pub keys: Map<String, Value>,
}

/// Hub side of the bridge: forwards readings to the hub and turns actuator
/// writes into MQTT publishes.
pub struct HubClient {
    registry: Arc<GatewayRegistry>,
    transport: Arc<dyn HubTransport>,
    mqtt: Arc<MqttBridge>,
    state: AtomicClientState,
}

impl HubClient {
    pub fn new(
        registry: Arc<GatewayRegistry>,
        transport: Arc<dyn HubTransport>,
        mqtt: Arc<MqttBridge>,
    ) -> Self {
        Self {
            registry,
            transport,
            mqtt,
            state: AtomicClientState::default(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state.load()
    }

    /// Publishes an actuator write on MQTT. Unknown gateways and gateways
    /// without a publish pattern drop the write. Returns the number of MQTT
    /// publishes accepted.
    pub async fn publish_actuator(&self, write: ActuatorWrite) -> usize {
        info!(
            gateway = %write.gateway,
            node = %write.node_addr,
            keys = %serde_json::Value::Object(write.keys.clone()),
            "Hub receive"
        );

        let gateway = match self.registry.find(&write.gateway) {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!(error = %e, "dropping actuator write");
                return 0;
            }
        };

        match build_publish(gateway, &write.node_addr, &write.keys) {
            Ok(requests) => self.mqtt.publish_all(requests).await,
            Err(e) => {
                warn!(gateway = %gateway.name, error = %e, "dropping actuator write");
                0
            }
        }
    }

    pub async fn emit_reading(&self, reading: &SensorReading) -> Result<(), TransportError> {
        debug!(gateway = %reading.gateway, node = %reading.node_address, "Hub emit");
        self.transport.emit(SENSOR_EVENT, reading.to_hub_payload()).await
    }

    /// Emits every reading produced by the MQTT side until the channel
    /// closes or `cancel` fires. Failed emits are logged and dropped.
    pub async fn forward_readings(
        &self,
        mut readings: mpsc::Receiver<SensorReading>,
        cancel: CancellationToken,
    ) {
        loop {
            let reading = tokio::select! {
                _ = cancel.cancelled() => break,
                reading = readings.recv() => match reading {
                    Some(reading) => reading,
                    None => break,
                },
            };

            if let Err(e) = self.emit_reading(&reading).await {
                error!(
                    gateway = %reading.gateway,
                    node = %reading.node_address,
                    error = %e,
                    "Hub emit failed, reading dropped"
                );
            }
        }

        info!("Hub forwarder stopped");
    }
}

#[async_trait]
impl HubEventHandler for HubClient {
    async fn on_connect(&self) {
        self.state.swap(ClientState::Connected);
        info!("Hub connected OK");

        for name in self.registry.names() {
            if let Err(e) = self.transport.join(name).await {
                error!(gateway = %name, error = %e, "Hub join failed");
            }
        }
    }

    async fn on_disconnect(&self) {
        self.state.swap(ClientState::Disconnected);
        error!("Hub disconnect");
    }

    async fn on_event(&self, event: &str, data: Value) {
        if event != ACTUATOR_EVENT {
            debug!(event = %event, "ignoring hub event");
            return;
        }

        match serde_json::from_value::<ActuatorWrite>(data) {
            Ok(write) => {
                self.publish_actuator(write).await;
            }
            Err(e) => warn!(error = %e, "malformed actuator write dropped"),
        }
    }
}
