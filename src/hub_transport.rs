use crate::transport::{HubEventHandler, HubTransport, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event used to register interest in a gateway room.
pub const JOIN_EVENT: &str = "join";

/// One text frame on the hub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl HubFrame {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn join(room: &str) -> Self {
        Self::new(JOIN_EVENT, json!({ "room": room }))
    }
}

/// Websocket connection to the hub carrying JSON [`HubFrame`]s.
pub struct WsHubTransport {
    url: String,
    reconnect_wait: Duration,
    outgoing: RwLock<Option<mpsc::Sender<Message>>>,
}

impl WsHubTransport {
    pub fn new(url: String, reconnect_wait: Duration) -> Self {
        Self {
            url,
            reconnect_wait,
            outgoing: RwLock::new(None),
        }
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let sender = self
            .outgoing
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        sender
            .send(message)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Keeps a connection to the hub open until `cancel` fires, dispatching
    /// received frames to `handler` and reconnecting after every drop.
    pub async fn run(&self, handler: Arc<dyn HubEventHandler>, cancel: CancellationToken) {
        loop {
            let mut attempt: u64 = 0;
            let connect = Retry::start(FixedInterval::new(self.reconnect_wait), || {
                attempt += 1;
                if attempt > 1 {
                    error!(url = %self.url, attempt = attempt, "Hub connect wait...");
                }
                connect_async(self.url.as_str())
            });

            let ws_stream = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect => match result {
                    Ok((ws_stream, _)) => ws_stream,
                    Err(e) => {
                        error!(url = %self.url, error = %e, "Hub connect failed");
                        continue;
                    }
                },
            };
            info!(url = %self.url, "connected to hub");

            let (mut write, mut read) = ws_stream.split();
            let (tx, mut rx) = mpsc::channel::<Message>(64);
            *self.outgoing.write().await = Some(tx);

            let writer = tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if let Err(e) = write.send(message).await {
                        error!(error = %e, "Hub write failed");
                        break;
                    }
                }
            });

            handler.on_connect().await;

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = self.send(Message::Close(None)).await;
                        break;
                    }
                    message = read.next() => message,
                };

                match message {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<HubFrame>(text.as_str()) {
                        Ok(frame) => handler.on_event(&frame.event, frame.data).await,
                        Err(e) => warn!(error = %e, "Hub frame is not valid JSON, ignored"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        tracing::trace!("Received ping: {:?}", data);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Hub read failed");
                        break;
                    }
                }
            }

            // Dropping the sender ends the writer once queued frames are out.
            self.outgoing.write().await.take();
            if let Err(e) = writer.await {
                debug!(error = %e, "Hub writer task ended abnormally");
            }
            handler.on_disconnect().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_wait) => {}
            }
        }

        info!("Hub loop stopped");
    }
}

#[async_trait]
impl HubTransport for WsHubTransport {
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        let text = serde_json::to_string(&HubFrame::new(event, data))?;
        self.send(Message::Text(text.into())).await
    }

    async fn join(&self, room: &str) -> Result<(), TransportError> {
        let text = serde_json::to_string(&HubFrame::join(room))?;
        self.send(Message::Text(text.into())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct RecordingHandler {
        connects: Mutex<u32>,
        events: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl HubEventHandler for RecordingHandler {
        async fn on_connect(&self) {
            *self.connects.lock().unwrap() += 1;
        }

        async fn on_disconnect(&self) {}

        async fn on_event(&self, event: &str, data: Value) {
            self.events.lock().unwrap().push((event.to_string(), data));
        }
    }

    #[test]
    fn test_frame_format() {
        let frame = HubFrame::join("wifi");
        let text = serde_json::to_string(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"event": "join", "data": {"room": "wifi"}}));

        let frame: HubFrame = serde_json::from_str(r#"{"event": "ping"}"#).unwrap();
        assert_eq!(frame.data, Value::Null);
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_fails() {
        let transport = WsHubTransport::new("ws://127.0.0.1:1/".to_string(), Duration::from_secs(1));
        assert!(matches!(
            transport.emit("sensor_addr_response", json!({})).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_with_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Server: push one actuator frame, then echo back the first frame
        // the client sends as a "seen" event.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            let frame = HubFrame::new("actuator_addr_response", json!({"gateway": "wifi"}));
            ws.send(Message::Text(serde_json::to_string(&frame).unwrap().into()))
                .await
                .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let received: HubFrame = serde_json::from_str(text.as_str()).unwrap();
                    let seen = HubFrame::new("seen", json!(received.event));
                    ws.send(Message::Text(serde_json::to_string(&seen).unwrap().into()))
                        .await
                        .unwrap();
                    break;
                }
            }
        });

        let transport = Arc::new(WsHubTransport::new(
            format!("ws://{}/", addr),
            Duration::from_millis(100),
        ));
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();

        let run = {
            let transport = transport.clone();
            let handler: Arc<dyn HubEventHandler> = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { transport.run(handler, cancel).await })
        };

        // Wait for the actuator frame to arrive, then emit.
        for _ in 0..50 {
            if !handler.events.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        transport.join("wifi").await.unwrap();

        for _ in 0..50 {
            if handler.events.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        run.await.unwrap();
        server.await.unwrap();

        assert_eq!(*handler.connects.lock().unwrap(), 1);
        let events = handler.events.lock().unwrap();
        assert_eq!(events[0], ("actuator_addr_response".to_string(), json!({"gateway": "wifi"})));
        assert_eq!(events[1], ("seen".to_string(), json!("join")));
    }
}
