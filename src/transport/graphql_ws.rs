//! GraphQL-over-WebSocket subscription transport.
//!
//! One WebSocket connection is opened per transport and shared by every subscription made
//! through it. A background task owns the socket: it writes operation frames on behalf of
//! subscriptions and routes incoming frames to them by operation id.
//!
//! Both subprotocols the server accepts are supported:
//!
//! | | `graphql-ws` | `graphql-transport-ws` |
//! |---|---|---|
//! | start operation | `start` | `subscribe` |
//! | update | `data` | `next` |
//! | stop operation | `stop` | `complete` |
//! | keep-alive | `ka` | `ping` / `pong` |
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use sinewave_bench::channel::ChannelId;
//! use sinewave_bench::transport::graphql_ws::{GraphqlWsTransport, WsProtocol};
//! use sinewave_bench::transport::SubscriptionTransport;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = GraphqlWsTransport::connect(
//!     "ws://localhost:8000/subscriptions",
//!     WsProtocol::GraphqlWs,
//!     Duration::from_secs(5),
//! )
//! .await?;
//! let sub = transport.subscribe(&ChannelId::sinewave_simple(1000, 0.1)).await?;
//! sub.unsubscribe(Duration::from_secs(1)).await;
//! transport.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::channel::ChannelId;
use crate::error::TransportError;
use crate::payload::Message;
use crate::transport::{Subscription, SubscriptionEvent, SubscriptionTransport, EVENT_QUEUE_CAPACITY};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket subprotocol spoken with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WsProtocol {
    /// Legacy Apollo `subscriptions-transport-ws` protocol.
    #[default]
    GraphqlWs,
    /// The `graphql-ws` library's protocol.
    GraphqlTransportWs,
}

impl WsProtocol {
    /// Value of the `Sec-WebSocket-Protocol` header.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            WsProtocol::GraphqlWs => "graphql-ws",
            WsProtocol::GraphqlTransportWs => "graphql-transport-ws",
        }
    }

    fn start_type(&self) -> &'static str {
        match self {
            WsProtocol::GraphqlWs => "start",
            WsProtocol::GraphqlTransportWs => "subscribe",
        }
    }

    fn stop_type(&self) -> &'static str {
        match self {
            WsProtocol::GraphqlWs => "stop",
            WsProtocol::GraphqlTransportWs => "complete",
        }
    }
}

impl std::fmt::Display for WsProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.subprotocol())
    }
}

/// Subscription document selecting the channel id and its base64 array value.
pub fn subscription_query(channel: &ChannelId) -> String {
    format!(
        "subscription {{ subscribeChannel(id: \"{channel}\") {{ id value {{ base64Array {{ numberType base64 }} }} }} }}"
    )
}

#[derive(Debug, Deserialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
}

enum Command {
    Start {
        id: String,
        query: String,
        events: mpsc::Sender<SubscriptionEvent>,
        ack: oneshot::Sender<Result<(), TransportError>>,
    },
    Stop {
        id: String,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Shared GraphQL WebSocket connection.
///
/// If the socket task has ended (read error, server close) the next `subscribe`
/// re-establishes the connection before starting its operation, so one dropped
/// connection only fails the operations that were live on it.
#[derive(Debug, Clone)]
pub struct GraphqlWsTransport {
    endpoint: String,
    protocol: WsProtocol,
    handshake_timeout: Duration,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    commands: Mutex<mpsc::UnboundedSender<Command>>,
    closed: AtomicBool,
}

impl GraphqlWsTransport {
    /// Open the WebSocket and complete the `connection_init` / `connection_ack` handshake.
    ///
    /// `handshake_timeout` bounds the TCP/WebSocket upgrade and the wait for the ack
    /// separately. It also bounds every later reconnect.
    pub async fn connect(
        endpoint: &str,
        protocol: WsProtocol,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let commands = open(endpoint, protocol, handshake_timeout).await?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            protocol,
            handshake_timeout,
            shared: Arc::new(Shared {
                commands: Mutex::new(commands),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Endpoint URL this transport is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Negotiated subprotocol.
    pub fn protocol(&self) -> WsProtocol {
        self.protocol
    }

    /// Terminate the connection and wait for the socket task to finish.
    ///
    /// A closed transport does not reconnect; later subscribes fail with `Closed`.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let commands = self.shared.commands.lock().await.clone();
        let (done, wait) = oneshot::channel();
        if commands.send(Command::Close { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Command queue of a running socket task, reconnecting first if the last one ended.
    async fn live_commands(&self) -> Result<mpsc::UnboundedSender<Command>, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut commands = self.shared.commands.lock().await;
        if commands.is_closed() {
            tracing::warn!(endpoint = %self.endpoint, "Connection lost, reconnecting");
            *commands = open(&self.endpoint, self.protocol, self.handshake_timeout).await?;
            tracing::info!(endpoint = %self.endpoint, "Reconnected");
        }
        Ok(commands.clone())
    }
}

#[async_trait]
impl SubscriptionTransport for GraphqlWsTransport {
    async fn subscribe(&self, channel: &ChannelId) -> Result<Subscription, TransportError> {
        let query = subscription_query(channel);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let commands = self.live_commands().await?;
            let id = uuid::Uuid::new_v4().simple().to_string();
            let (events, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
            let (ack, ack_rx) = oneshot::channel();

            let start = Command::Start {
                id: id.clone(),
                query: query.clone(),
                events,
                ack,
            };
            // A socket task that ends between the liveness check and this send drops the
            // command unanswered
            let acked = match commands.send(start) {
                Ok(()) => ack_rx.await.unwrap_or(Err(TransportError::Closed)),
                Err(_) => Err(TransportError::Closed),
            };
            match acked {
                Ok(()) => {
                    tracing::debug!(%channel, id = %id, "Subscription started");
                    let canceller = move || {
                        let _ = commands.send(Command::Stop { id });
                    };
                    return Ok(Subscription::new(channel.clone(), rx, Box::new(canceller)));
                }
                Err(TransportError::Closed) if attempt < 2 => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Connect, handshake and spawn the socket task; returns its command queue.
async fn open(
    endpoint: &str,
    protocol: WsProtocol,
    handshake_timeout: Duration,
) -> Result<mpsc::UnboundedSender<Command>, TransportError> {
    let url = Url::parse(endpoint)?;
    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(protocol.subprotocol()),
    );

    // A 10^7 element update is ~107 MB of base64 in a single frame
    let mut config = WebSocketConfig::default();
    config.max_message_size = None;
    config.max_frame_size = None;

    tracing::info!(endpoint, %protocol, "Connecting");
    let (mut ws, _response) = timeout(
        handshake_timeout,
        connect_async_with_config(request, Some(config), false),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout(handshake_timeout))??;

    send_json(&mut ws, &json!({ "type": "connection_init", "payload": {} })).await?;
    timeout(handshake_timeout, await_ack(&mut ws))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(handshake_timeout))??;
    tracing::info!(endpoint, "Connection acknowledged");

    let (commands, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(Connection::new(ws, protocol).run(command_rx));
    Ok(commands)
}

async fn send_json(ws: &mut WsStream, frame: &Value) -> Result<(), TransportError> {
    ws.send(WsMessage::Text(frame.to_string())).await?;
    Ok(())
}

async fn await_ack(ws: &mut WsStream) -> Result<(), TransportError> {
    while let Some(msg) = ws.next().await {
        let text = match msg? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => return Err(TransportError::Closed),
            _ => continue,
        };
        let frame: ServerFrame = serde_json::from_str(&text)?;
        match frame.kind.as_str() {
            "connection_ack" => return Ok(()),
            "connection_error" => {
                return Err(TransportError::ConnectionRejected(frame.payload.to_string()))
            }
            "ping" => send_json(ws, &json!({ "type": "pong" })).await?,
            "ka" | "pong" => {}
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected connection_ack, got '{other}'"
                )))
            }
        }
    }
    Err(TransportError::Closed)
}

struct Connection {
    ws: WsStream,
    protocol: WsProtocol,
    routes: HashMap<String, mpsc::Sender<SubscriptionEvent>>,
}

impl Connection {
    fn new(ws: WsStream, protocol: WsProtocol) -> Self {
        Self {
            ws,
            protocol,
            routes: HashMap::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut close_waiter = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { id, query, events, ack }) => {
                        let frame = json!({
                            "type": self.protocol.start_type(),
                            "id": id,
                            "payload": { "query": query, "variables": null },
                        });
                        let result = send_json(&mut self.ws, &frame).await;
                        if result.is_ok() {
                            self.routes.insert(id, events);
                        }
                        let _ = ack.send(result);
                    }
                    Some(Command::Stop { id }) => {
                        // Dropping the route closes the subscriber's queue
                        if self.routes.remove(&id).is_some() {
                            let frame = json!({ "type": self.protocol.stop_type(), "id": id });
                            if let Err(e) = send_json(&mut self.ws, &frame).await {
                                tracing::warn!(id = %id, error = %e, "Failed to send stop");
                            }
                        }
                    }
                    Some(Command::Close { done }) => {
                        close_waiter = Some(done);
                        break;
                    }
                    None => break,
                },
                msg = self.ws.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = self.dispatch(&text).await {
                            tracing::warn!(error = %e, "Dropping connection");
                            self.fail_all(&e.to_string()).await;
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!(?frame, "Server closed connection");
                        self.fail_all("connection closed by server").await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "WebSocket error");
                        self.fail_all(&e.to_string()).await;
                        break;
                    }
                    None => {
                        self.fail_all("connection closed").await;
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
        if let Some(done) = close_waiter {
            let _ = done.send(());
        }
    }

    async fn dispatch(&mut self, text: &str) -> Result<(), TransportError> {
        let mut frame: ServerFrame = serde_json::from_str(text)?;
        match frame.kind.as_str() {
            "data" | "next" => {
                let Some(id) = frame.id.as_deref() else {
                    return Err(TransportError::Protocol("update without operation id".into()));
                };
                let event = update_event(&mut frame.payload);
                let terminal = matches!(event, SubscriptionEvent::Error(_));
                self.route(id, event, terminal).await;
            }
            "error" => {
                if let Some(id) = frame.id.as_deref() {
                    let reason = frame.payload.to_string();
                    self.route(id, SubscriptionEvent::Error(reason), true).await;
                }
            }
            "complete" => {
                if let Some(id) = frame.id.as_deref() {
                    self.route(id, SubscriptionEvent::Complete, true).await;
                }
            }
            "ping" => send_json(&mut self.ws, &json!({ "type": "pong" })).await?,
            "ka" | "pong" | "connection_ack" => {}
            "connection_error" => {
                return Err(TransportError::ConnectionRejected(frame.payload.to_string()))
            }
            other => tracing::debug!(kind = other, "Ignoring unknown frame"),
        }
        Ok(())
    }

    async fn route(&mut self, id: &str, event: SubscriptionEvent, terminal: bool) {
        let Some(events) = self.routes.get(id) else {
            // Frames for stopped operations can still be in flight
            tracing::trace!(id, "Frame for unknown operation");
            return;
        };
        if events.send(event).await.is_ok() {
            if terminal {
                self.routes.remove(id);
            }
            return;
        }
        // Subscriber went away without unsubscribing
        self.routes.remove(id);
        let frame = json!({ "type": self.protocol.stop_type(), "id": id });
        if let Err(e) = send_json(&mut self.ws, &frame).await {
            tracing::warn!(id, error = %e, "Failed to send stop for abandoned operation");
        }
    }

    async fn fail_all(&mut self, reason: &str) {
        for (_, events) in self.routes.drain() {
            let _ = events.send(SubscriptionEvent::Error(reason.to_string())).await;
        }
    }

    async fn shutdown(&mut self) {
        self.routes.clear();
        if self.protocol == WsProtocol::GraphqlWs {
            let _ = send_json(&mut self.ws, &json!({ "type": "connection_terminate" })).await;
        }
        let _ = self.ws.close(None).await;
    }
}

/// Turn a `data`/`next` payload into a subscription event.
fn update_event(payload: &mut Value) -> SubscriptionEvent {
    if let Some(channel) = payload.pointer_mut("/data/subscribeChannel") {
        if !channel.is_null() {
            let id = channel.get("id").and_then(Value::as_str).map(str::to_string);
            let value = channel.get_mut("value").map(Value::take).unwrap_or(Value::Null);
            return SubscriptionEvent::Data(Message { id, value });
        }
    }
    match payload.get("errors") {
        Some(errors) => SubscriptionEvent::Error(errors.to_string()),
        None => SubscriptionEvent::Error(format!("unexpected update payload: {payload}")),
    }
}
