use crate::gateway::GatewayRegistry;
use crate::transport::{AtomicClientState, ClientState, MqttEventHandler, MqttTransport, TransportError};
use crate::translate::{PatternTranslator, PublishRequest, SensorReading, TranslateError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters kept for the lifetime of the bridge.
#[derive(Debug, Default)]
pub struct BridgeStats {
    connects: AtomicU64,
    publishes_sent: AtomicU64,
    messages_received: AtomicU64,
    readings_forwarded: AtomicU64,
    messages_dropped: AtomicU64,
    publishes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connects: u64,
    pub publishes_sent: u64,
    pub messages_received: u64,
    pub readings_forwarded: u64,
    pub messages_dropped: u64,
    pub publishes: u64,
}

impl BridgeStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            publishes_sent: self.publishes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            readings_forwarded: self.readings_forwarded.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
        }
    }
}

/// MQTT side of the bridge.
///
/// Subscribes every gateway topic on connect, translates inbound messages
/// into [`SensorReading`]s for the hub and publishes actuator writes.
pub struct MqttBridge {
    registry: Arc<GatewayRegistry>,
    translator: PatternTranslator,
    transport: Arc<dyn MqttTransport>,
    readings: mpsc::Sender<SensorReading>,
    state: AtomicClientState,
    stats: BridgeStats,
}

impl MqttBridge {
    pub fn new(
        registry: Arc<GatewayRegistry>,
        transport: Arc<dyn MqttTransport>,
        readings: mpsc::Sender<SensorReading>,
    ) -> Result<Self, TranslateError> {
        let translator = PatternTranslator::new(&registry)?;

        Ok(Self {
            registry,
            translator,
            transport,
            readings,
            state: AtomicClientState::default(),
            stats: BridgeStats::default(),
        })
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub fn state(&self) -> ClientState {
        self.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribes every gateway's topic in registry order. Failures are
    /// logged and the remaining subscriptions still go out.
    pub async fn subscribe_all(&self) {
        for gateway in self.registry.all() {
            info!(gateway = %gateway.name, topic = %gateway.subscribe_topic, "MQTT subscribe");
            if let Err(e) = self.transport.subscribe(&gateway.subscribe_topic).await {
                error!(
                    gateway = %gateway.name,
                    topic = %gateway.subscribe_topic,
                    error = %e,
                    "MQTT subscribe failed"
                );
            }
        }
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        info!(topic = %topic, payload = %payload, "MQTT publish");
        BridgeStats::incr(&self.stats.publishes);
        self.transport.publish(topic, payload.as_bytes().to_vec()).await
    }

    /// Publishes each request independently; returns how many were accepted
    /// by the transport.
    pub async fn publish_all(&self, requests: Vec<PublishRequest>) -> usize {
        let mut accepted = 0;
        for request in requests {
            match self.publish(&request.topic, &request.payload).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    error!(topic = %request.topic, error = %e, "MQTT publish failed");
                }
            }
        }
        accepted
    }

    /// Translates one inbound message and hands the reading to the hub side
    /// without waiting.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        BridgeStats::incr(&self.stats.messages_received);
        info!(
            topic = %topic,
            payload = %String::from_utf8_lossy(payload),
            "MQTT receive"
        );

        let reading = match self.translator.translate(topic, payload) {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                warn!(topic = %topic, "MQTT topic does not match any gateway");
                BridgeStats::incr(&self.stats.messages_dropped);
                return;
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "dropping undecodable MQTT message");
                BridgeStats::incr(&self.stats.messages_dropped);
                return;
            }
        };

        match self.readings.try_send(reading) {
            Ok(()) => BridgeStats::incr(&self.stats.readings_forwarded),
            Err(TrySendError::Full(reading)) => {
                warn!(
                    gateway = %reading.gateway,
                    node = %reading.node_address,
                    "hub queue full, dropping reading"
                );
                BridgeStats::incr(&self.stats.messages_dropped);
            }
            Err(TrySendError::Closed(_)) => {
                error!(topic = %topic, "hub queue closed, dropping reading");
                BridgeStats::incr(&self.stats.messages_dropped);
            }
        }
    }

    /// Watches the connection until `cancel` fires: polls every
    /// `poll_interval` while connected and every `reconnect_wait` while not,
    /// logging each wait.
    pub async fn supervise(
        &self,
        poll_interval: Duration,
        reconnect_wait: Duration,
        cancel: CancellationToken,
    ) {
        info!("MQTT supervisor started");

        'supervise: loop {
            let mut attempts: u64 = 0;
            while !self.is_connected() {
                if attempts > 0 {
                    error!(attempt = attempts, "MQTT connect wait...");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break 'supervise,
                    _ = tokio::time::sleep(reconnect_wait) => {}
                }
                attempts += 1;
            }

            tokio::select! {
                _ = cancel.cancelled() => break 'supervise,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!("MQTT supervisor stopped");
    }
}

#[async_trait]
impl MqttEventHandler for MqttBridge {
    async fn on_connecting(&self) {
        self.state.swap(ClientState::Connecting);
        debug!("MQTT connecting");
    }

    async fn on_connect(&self, code: u8) {
        if code != 0 {
            self.state.swap(ClientState::Disconnected);
            error!(code = code, "MQTT connect ERROR");
            return;
        }

        self.state.swap(ClientState::Connected);
        info!("MQTT connected OK");

        // connects / reconnects counter
        BridgeStats::incr(&self.stats.connects);
    }

    async fn on_connected(&self) {
        self.subscribe_all().await;
    }

    async fn on_disconnect(&self, reason: &str) {
        self.state.swap(ClientState::Disconnected);
        error!(reason = %reason, "MQTT disconnect");
    }

    async fn on_publish_sent(&self, packet_id: u16) {
        BridgeStats::incr(&self.stats.publishes_sent);
        debug!(packet_id = packet_id, "MQTT published");
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        self.handle_message(topic, payload);
    }
}
