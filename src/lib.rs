//! Bidirectional bridge between an MQTT broker and a telemetry hub.
//!
//! Gateways declared in a YAML file map MQTT topics to hub node/key
//! coordinates. Inbound MQTT messages become `sensor_addr_response` events on
//! the hub; `actuator_addr_response` events from the hub become MQTT publishes.

pub mod bridge;
pub mod config;
pub mod gateway;
pub mod hub;
pub mod hub_transport;
pub mod mqtt_service;
pub mod service_utils;
pub mod translate;
pub mod transport;

pub use bridge::{MqttBridge, StatsSnapshot};
pub use config::{Config, ConfigError};
pub use gateway::{GatewayConfig, GatewayRegistry, RegistryError, Schema};
pub use hub::{ActuatorWrite, HubClient};
pub use translate::{build_publish, PatternTranslator, PublishRequest, SensorReading};
pub use transport::{ClientState, TransportError};
