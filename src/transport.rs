//! Capability seams between the bridge core and the two transports.
//!
//! The transports own the wire protocols; the core only issues requests
//! through `MqttTransport`/`HubTransport` and receives events through the
//! handler traits it implements.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("Client error: {0}")]
    Client(String),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Not connected")]
    NotConnected,
}

/// Requests the bridge issues to the MQTT broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn subscribe(&self, topic_filter: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Events delivered by the MQTT transport driver.
#[async_trait]
pub trait MqttEventHandler: Send + Sync {
    /// A (re)connect attempt is about to start.
    async fn on_connecting(&self) {}

    /// CONNACK received; `code` 0 means accepted. Runs on the driver task,
    /// so it must not issue requests through the client.
    async fn on_connect(&self, code: u8);

    /// Runs on its own task after an accepted CONNACK.
    async fn on_connected(&self) {}

    async fn on_disconnect(&self, reason: &str);

    async fn on_publish_sent(&self, _packet_id: u16) {}

    async fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Requests issued to the hub event channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubTransport: Send + Sync {
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError>;

    async fn join(&self, room: &str) -> Result<(), TransportError>;
}

/// Events delivered by the hub transport driver.
#[async_trait]
pub trait HubEventHandler: Send + Sync {
    async fn on_connect(&self);

    async fn on_disconnect(&self);

    async fn on_event(&self, event: &str, data: Value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ClientState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            2 => ClientState::Connected,
            1 => ClientState::Connecting,
            _ => ClientState::Disconnected,
        }
    }
}

/// Connection state of one transport, owned by the component driving it.
#[derive(Debug)]
pub struct AtomicClientState(AtomicU8);

impl AtomicClientState {
    pub fn new(state: ClientState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ClientState {
        ClientState::from_raw(self.0.load(Ordering::SeqCst))
    }

    /// Stores `state` and returns the previous one.
    pub fn swap(&self, state: ClientState) -> ClientState {
        ClientState::from_raw(self.0.swap(state as u8, Ordering::SeqCst))
    }
}

impl Default for AtomicClientState {
    fn default() -> Self {
        Self::new(ClientState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_state_transitions() {
        let state = AtomicClientState::default();
        assert_eq!(state.load(), ClientState::Disconnected);
        assert_eq!(state.swap(ClientState::Connecting), ClientState::Disconnected);
        assert_eq!(state.swap(ClientState::Connected), ClientState::Connecting);
        assert_eq!(state.load(), ClientState::Connected);
    }
}
