//! STOMP 1.2 broker sessions over a WebSocket.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::Credentials,
    error::ConnectionError,
    protocol::{Command, Frame},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, Interval},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::transport::{BrokerConnector, BrokerSession, Delivery, Subscription};

const ACCEPT_VERSION: &str = "1.2";

// Raw WebSocket transport of a SockJS endpoint.
const SOCKJS_WEBSOCKET_PATH: &str = "websocket";

/// `ws(s)://` endpoints are used as given. `http(s)://` endpoints are SockJS
/// endpoints and are mapped to their raw WebSocket transport,
/// `ws(s)://{endpoint}/websocket`.
pub fn websocket_url(endpoint: &str) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(endpoint)
        .map_err(|err| ConnectionError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "{endpoint}: unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidEndpoint(endpoint.to_string()))?;

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with(&format!("/{SOCKJS_WEBSOCKET_PATH}")) {
        url.set_path(&format!("{path}/{SOCKJS_WEBSOCKET_PATH}"));
    }
    Ok(url)
}

pub fn connect_frame(host: &str, credentials: &Credentials, heartbeat: Duration) -> Frame {
    let mut frame = Frame::new(Command::Connect)
        .header("accept-version", ACCEPT_VERSION)
        .header("host", host)
        .header("heart-beat", format!("{},0", heartbeat.as_millis()));
    if let Some(login) = &credentials.login {
        frame = frame.header("login", login.as_str());
    }
    if let Some(passcode) = &credentials.passcode {
        frame = frame.header("passcode", passcode.as_str());
    }
    if let Some(token) = &credentials.token {
        frame = frame.header("Authorization", format!("Bearer {token}"));
    }
    frame
}

/// Interval at which the client must send heart-beats, given what it offered
/// and the `heart-beat` header of the CONNECTED frame. Zero means none.
pub fn negotiate_heartbeat(offered: Duration, connected: &Frame) -> Duration {
    let wanted_by_server = connected
        .get("heart-beat")
        .and_then(|value| value.split(',').nth(1))
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0);
    if offered.is_zero() || wanted_by_server == 0 {
        return Duration::ZERO;
    }
    offered.max(Duration::from_millis(wanted_by_server))
}

pub struct StompConnector {
    heartbeat: Duration,
}

impl StompConnector {
    pub fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl BrokerConnector for StompConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BrokerSession>, ConnectionError> {
        let url = websocket_url(endpoint)?;
        let host = url.host_str().unwrap_or("localhost").to_string();
        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|err| ConnectionError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        ws_writer
            .send(Message::Text(
                connect_frame(&host, credentials, self.heartbeat).encode(),
            ))
            .await
            .map_err(|err| ConnectionError::Transport(err.to_string()))?;

        let connected = 'handshake: loop {
            match ws_reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frames = Frame::decode_all(&text)
                        .map_err(|err| ConnectionError::Transport(err.to_string()))?;
                    for frame in frames {
                        match frame.command {
                            Command::Connected => break 'handshake frame,
                            Command::Error => {
                                let reason =
                                    frame.get("message").unwrap_or(&frame.body).to_string();
                                return Err(ConnectionError::Rejected(reason));
                            }
                            other => {
                                return Err(ConnectionError::Transport(format!(
                                    "unexpected {other} frame during handshake"
                                )))
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ConnectionError::Rejected(
                        "connection closed during handshake".into(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(ConnectionError::Transport(err.to_string())),
            }
        };

        let heartbeat = negotiate_heartbeat(self.heartbeat, &connected);
        info!(
            endpoint,
            version = connected.get("version").unwrap_or(ACCEPT_VERSION),
            heartbeat_ms = heartbeat.as_millis() as u64,
            "stomp session established"
        );

        let shared = Arc::new(SessionShared {
            connected: AtomicBool::new(true),
            routes: Mutex::new(HashMap::new()),
        });
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

        let writer_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut ticker: Option<Interval> = (!heartbeat.is_zero())
                .then(|| interval_at(Instant::now() + heartbeat, heartbeat));
            loop {
                let tick = async {
                    match ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => futures::future::pending::<()>().await,
                    }
                };
                let sent = tokio::select! {
                    command = outbound_rx.recv() => match command {
                        Some(Outbound::Frame(frame)) => {
                            ws_writer.send(Message::Text(frame.encode())).await
                        }
                        Some(Outbound::Close) | None => {
                            let _ = ws_writer
                                .send(Message::Text(Frame::new(Command::Disconnect).encode()))
                                .await;
                            let _ = ws_writer.close().await;
                            break;
                        }
                    },
                    _ = tick => ws_writer.send(Message::Text("\n".into())).await,
                };
                if let Err(err) = sent {
                    warn!("stomp write failed: {err}");
                    break;
                }
            }
            writer_shared.connected.store(false, Ordering::SeqCst);
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode_all(&text) {
                        Ok(frames) => {
                            for frame in frames {
                                reader_shared.dispatch(frame).await;
                            }
                        }
                        Err(err) => warn!("dropping undecodable stomp message: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("stomp receive failed: {err}");
                        break;
                    }
                }
            }
            reader_shared.connected.store(false, Ordering::SeqCst);
            reader_shared.routes.lock().await.clear();
            debug!("stomp reader finished");
        });

        Ok(Arc::new(StompSession {
            outbound,
            shared,
            reader_task,
        }))
    }
}

enum Outbound {
    Frame(Frame),
    Close,
}

struct Route {
    destination: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct SessionShared {
    connected: AtomicBool,
    routes: Mutex<HashMap<String, Route>>,
}

impl SessionShared {
    async fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let Some(subscription_id) = frame.get("subscription") else {
                    warn!("MESSAGE frame without subscription header");
                    return;
                };
                let routes = self.routes.lock().await;
                let Some(route) = routes.get(subscription_id) else {
                    debug!(subscription_id, "MESSAGE for released subscription");
                    return;
                };
                let destination = frame
                    .get("destination")
                    .unwrap_or(&route.destination)
                    .to_string();
                let _ = route.tx.send(Delivery {
                    destination,
                    body: frame.body,
                });
            }
            Command::Error => {
                warn!(
                    reason = frame.get("message").unwrap_or_default(),
                    "broker reported an error: {}", frame.body
                );
            }
            Command::Receipt => debug!(receipt = frame.get("receipt-id"), "receipt"),
            other => debug!(command = %other, "ignoring frame"),
        }
    }
}

pub struct StompSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<SessionShared>,
    reader_task: JoinHandle<()>,
}

impl StompSession {
    fn send_frame(&self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ConnectionError::NotConnected)
    }
}

#[async_trait]
impl BrokerSession for StompSession {
    async fn subscribe(&self, destination: &str) -> Result<Subscription, ConnectionError> {
        let id = format!("sub-{}", Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.routes.lock().await.insert(
            id.clone(),
            Route {
                destination: destination.to_string(),
                tx,
            },
        );

        let frame = Frame::new(Command::Subscribe)
            .header("id", id.as_str())
            .header("destination", destination)
            .header("ack", "auto");
        if let Err(err) = self.send_frame(frame) {
            self.shared.routes.lock().await.remove(&id);
            return Err(err);
        }

        Ok(Subscription {
            id,
            destination: destination.to_string(),
            deliveries: rx,
        })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ConnectionError> {
        self.shared.routes.lock().await.remove(subscription_id);
        self.send_frame(Frame::new(Command::Unsubscribe).header("id", subscription_id))
    }

    async fn publish(&self, destination: &str, body: String) -> Result<(), ConnectionError> {
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .with_body(body);
        self.send_frame(frame)
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
        self.shared.routes.lock().await.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for StompSession {
    fn drop(&mut self) {
        // The writer exits once `outbound` is dropped; the reader would
        // otherwise run until the broker closes the socket.
        self.reader_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/stomp_tests.rs"]
mod tests;
