use crate::transport::{MqttEventHandler, MqttTransport, TransportError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Broker connection parameters.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub keepalive: Duration,
    pub client_id: String,
    /// Capacity of the client request queue.
    pub request_capacity: usize,
}

/// Numeric CONNACK return code as defined by MQTT 3.1.1.
fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// `MqttTransport` backed by a rumqttc client.
#[derive(Clone)]
pub struct RumqttTransport {
    client: AsyncClient,
}

/// Event loop half of a connection, driven by [`MqttSession::run`].
pub struct MqttSession {
    eventloop: EventLoop,
    initial_connack: Option<u8>,
}

impl RumqttTransport {
    /// Connects to the broker and waits for the first CONNACK. A network
    /// failure or a refused connection is returned as an error.
    pub async fn connect(config: &MqttConfig) -> Result<(Self, MqttSession), TransportError> {
        info!(
            "connecting to mqtt broker ({}:{}) as {}",
            config.mqtt_host, config.mqtt_port, config.client_id
        );

        let mut mqtt_options =
            MqttOptions::new(&config.client_id, &config.mqtt_host, config.mqtt_port);
        mqtt_options.set_keep_alive(config.keepalive);
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, config.request_capacity);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    let code = connack_code(connack.code);
                    if code != 0 {
                        return Err(TransportError::Connect(format!(
                            "broker refused connection: code={}",
                            code
                        )));
                    }
                    return Ok((
                        Self { client },
                        MqttSession {
                            eventloop,
                            initial_connack: Some(code),
                        },
                    ));
                }
                Ok(event) => {
                    debug!("MQTT event before CONNACK: {:?}", event);
                }
                Err(e) => {
                    return Err(TransportError::Connect(format!(
                        "{}:{}: {}",
                        config.mqtt_host, config.mqtt_port, e
                    )));
                }
            }
        }
    }

    /// Queues a DISCONNECT without waiting on the request queue.
    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect request failed: {:?}", e);
        }
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn subscribe(&self, topic_filter: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic_filter, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // Never wait on a full request queue; the write is dropped instead.
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| TransportError::Client(e.to_string()))
    }
}

impl MqttSession {
    /// Drives the rumqttc event loop until `cancel` fires, dispatching every
    /// event to `handler`. After a connection error the loop waits
    /// `reconnect_wait` and polls again, which makes rumqttc reconnect.
    pub async fn run(
        mut self,
        handler: Arc<dyn MqttEventHandler>,
        reconnect_wait: Duration,
        cancel: CancellationToken,
    ) {
        if let Some(code) = self.initial_connack.take() {
            dispatch_connack(&handler, code).await;
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    dispatch_connack(&handler, connack_code(connack.code)).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handler.on_message(&publish.topic, &publish.payload).await;
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    debug!(pkid = suback.pkid, "subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    handler.on_disconnect("broker sent DISCONNECT").await;
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    handler.on_publish_sent(pkid).await;
                }
                Ok(_) => {}
                Err(e) => {
                    match &e {
                        ConnectionError::ConnectionRefused(code) => {
                            handler.on_connect(connack_code(*code)).await;
                        }
                        _ => handler.on_disconnect(&e.to_string()).await,
                    }

                    warn!("Lost connection to MQTT broker. Retrying in {:?}...", reconnect_wait);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_wait) => {}
                    }
                    handler.on_connecting().await;
                }
            }
        }

        info!("MQTT event loop stopped");
    }
}

/// `on_connect` runs inline so it stays ordered with `on_disconnect`.
/// `on_connected` subscribes through the same request queue this loop
/// drains, so it must not run on the loop itself.
async fn dispatch_connack(handler: &Arc<dyn MqttEventHandler>, code: u8) {
    handler.on_connect(code).await;
    if code == 0 {
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.on_connected().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MqttBridge;
    use crate::gateway::{GatewayConfig, GatewayRegistry};
    use crate::transport::{ClientState, MockMqttTransport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_connack_codes() {
        assert_eq!(connack_code(ConnectReturnCode::Success), 0);
        assert_eq!(connack_code(ConnectReturnCode::ServiceUnavailable), 3);
        assert_eq!(connack_code(ConnectReturnCode::NotAuthorized), 5);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        // Port 1 on localhost has no listener.
        let config = MqttConfig {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1,
            keepalive: Duration::from_secs(5),
            client_id: "bridge-test".to_string(),
            request_capacity: 10,
        };

        match RumqttTransport::connect(&config).await {
            Err(TransportError::Connect(_)) => {}
            Err(e) => panic!("unexpected error: {:?}", e),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_connection_is_queued_or_rejected() {
        let mut mqtt_options = MqttOptions::new("bridge-test", "127.0.0.1", 1);
        mqtt_options.set_keep_alive(Duration::from_secs(5));
        let (client, _eventloop) = AsyncClient::new(mqtt_options, 1);
        let transport = RumqttTransport { client };

        // The first request fits the queue, the next one is rejected
        // immediately instead of blocking.
        assert!(transport.publish("dev/a", b"1".to_vec()).await.is_ok());
        assert!(matches!(
            transport.publish("dev/b", b"2".to_vec()).await,
            Err(TransportError::Client(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_after_connack_leaves_bridge_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accept the CONNECT, answer with an accepted CONNACK, then hang up.
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let config = MqttConfig {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: port,
            keepalive: Duration::from_secs(30),
            client_id: "bridge-test".to_string(),
            request_capacity: 10,
        };
        let (transport, session) = RumqttTransport::connect(&config).await.unwrap();
        drop(transport);

        let mut mqtt = MockMqttTransport::new();
        mqtt.expect_subscribe().returning(|_| Ok(()));
        let registry = Arc::new(GatewayRegistry::new(vec![GatewayConfig::new("gw")]).unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let bridge = Arc::new(MqttBridge::new(registry, Arc::new(mqtt), tx).unwrap());

        let cancel = CancellationToken::new();
        let driver = {
            let bridge = bridge.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                session
                    .run(bridge, Duration::from_secs(60), cancel)
                    .await;
            })
        };

        let mut disconnected = false;
        for _ in 0..200 {
            if bridge.stats().connects == 1 && bridge.state() == ClientState::Disconnected {
                disconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(disconnected, "bridge never saw the drop");

        // Nothing queued behind the drop may flip the state back.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bridge.state(), ClientState::Disconnected);

        cancel.cancel();
        driver.await.unwrap();
        broker.await.unwrap();
    }
}
