//! WebSocket RPC client for the game server.
//!
//! One background task owns the socket and multiplexes traffic:
//!
//! ```text
//! RpcClient
//!     ├── outbound mpsc → socket writes
//!     ├── inbound frames → pending-call table (by sequence)
//!     │                  → registered message handlers (in order)
//!     │                  → event channel
//!     └── reconnection (attempt-second sleep, up to 5 attempts)
//! ```
//!
//! Sequences are allocated from an atomic counter that restarts at 1 on
//! every connection. A pending call is registered *before* its frame is
//! written so a fast response can never outrace the bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::constants::{COMPANION_PROXY_HOST, DEFAULT_REQUEST_TIMEOUT, RPC_MAX_RECONNECT_ATTEMPTS};
use crate::pairing::ServerPairing;
use crate::rpc::proto::{
    AppEmpty, AppEntityInfo, AppInfo, AppMap, AppMessage, AppRequest, AppSendMessage,
    AppSetEntityValue, AppTeamInfo, AppTeamMessage, AppTime,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection parameters for a game server.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub server: String,
    pub port: u16,
    pub player_id: u64,
    pub player_token: i32,
    /// Route through the HTTPS companion proxy instead of dialing the
    /// server directly.
    pub use_proxy: bool,
}

impl RpcConfig {
    pub fn from_pairing(pairing: &ServerPairing) -> Self {
        Self {
            server: pairing.host.clone(),
            port: pairing.port,
            player_id: pairing.player_id,
            player_token: pairing.player_token,
            use_proxy: false,
        }
    }

    fn websocket_url(&self) -> String {
        let query = format!(
            "playerid={}&playertoken={}&protocol=2&app=companion",
            self.player_id, self.player_token
        );
        if self.use_proxy {
            format!(
                "wss://{COMPANION_PROXY_HOST}/game/{}/{}?{query}",
                self.server, self.port
            )
        } else {
            format!("ws://{}:{}/?{query}", self.server, self.port)
        }
    }
}

/// Errors surfaced by RPC calls.
#[derive(Debug)]
pub enum RpcError {
    /// No live connection; nothing was sent.
    NotConnected,
    /// The deadline elapsed before a response arrived.
    TimedOut,
    /// A response arrived but did not carry the expected payload.
    InvalidResponse,
    /// The socket could not be established.
    Transport(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::TimedOut => write!(f, "request timed out"),
            Self::InvalidResponse => write!(f, "invalid response"),
            Self::Transport(msg) => write!(f, "transport failed: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// Client lifecycle and traffic events.
#[derive(Debug)]
pub enum RpcEvent {
    Connecting,
    Connected,
    Disconnected,
    /// A request was written to the socket.
    Request(AppRequest),
    /// Any inbound frame, response or broadcast.
    Message(AppMessage),
}

/// Identifies a registered message handler for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

type MessageHandler = Arc<dyn Fn(&AppMessage) -> bool + Send + Sync>;

pub(crate) struct RpcInner {
    config: RpcConfig,
    seq: AtomicU32,
    connected: AtomicBool,
    pending: Mutex<HashMap<u32, oneshot::Sender<AppMessage>>>,
    handlers: Mutex<Vec<(u64, MessageHandler)>>,
    next_handler_id: AtomicU64,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    events_tx: Mutex<Option<mpsc::Sender<RpcEvent>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl RpcInner {
    pub(crate) fn emit(&self, event: RpcEvent) {
        if let Some(tx) = self.events_tx.lock().expect("events channel lock poisoned").as_ref() {
            if tx.try_send(event).is_err() {
                log::warn!("rpc event channel full or closed, event dropped");
            }
        }
    }

    fn stamp(&self, mut request: AppRequest) -> (u32, AppRequest) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        request.seq = Some(seq);
        request.player_id = Some(self.config.player_id);
        request.player_token = Some(self.config.player_token);
        (seq, request)
    }

    /// Fire-and-forget send. Returns the stamped sequence.
    pub(crate) async fn send_request(&self, request: AppRequest) -> Result<u32, RpcError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RpcError::NotConnected);
        }
        let (seq, request) = self.stamp(request);
        let frame = request.encode_to_vec();
        self.outgoing_tx
            .send(frame)
            .await
            .map_err(|_| RpcError::NotConnected)?;
        self.emit(RpcEvent::Request(request));
        Ok(seq)
    }

    /// Send a request and await its sequenced response.
    pub(crate) async fn send_request_async(
        &self,
        request: AppRequest,
        timeout: Duration,
    ) -> Result<AppMessage, RpcError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RpcError::NotConnected);
        }
        let (seq, request) = self.stamp(request);

        // Register before writing: a response must never find the table
        // without its entry.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending table lock poisoned").insert(seq, tx);

        let frame = request.encode_to_vec();
        if self.outgoing_tx.send(frame).await.is_err() {
            self.pending.lock().expect("pending table lock poisoned").remove(&seq);
            return Err(RpcError::NotConnected);
        }
        self.emit(RpcEvent::Request(request));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => {
                self.pending.lock().expect("pending table lock poisoned").remove(&seq);
                Err(RpcError::TimedOut)
            }
            Err(_) => {
                self.pending.lock().expect("pending table lock poisoned").remove(&seq);
                Err(RpcError::TimedOut)
            }
        }
    }

    pub(crate) fn add_message_handler(&self, handler: MessageHandler) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().expect("handlers lock poisoned").push((id, handler));
        HandlerId(id)
    }

    pub(crate) fn remove_message_handler(&self, id: HandlerId) {
        self.handlers.lock().expect("handlers lock poisoned").retain(|(hid, _)| *hid != id.0);
    }

    fn close(&self) {
        if let Some(tx) = self.shutdown.lock().expect("shutdown lock poisoned").take() {
            let _ = tx.send(());
        }
        self.events_tx.lock().expect("events channel lock poisoned").take();
    }
}

/// Handle to a live RPC connection. Dropping it closes the connection.
pub struct RpcClient {
    inner: Arc<RpcInner>,
}

impl RpcClient {
    /// Dial the server and spawn the connection task.
    pub async fn connect(
        config: RpcConfig,
    ) -> Result<(Self, mpsc::Receiver<RpcEvent>), RpcError> {
        let (events_tx, events_rx) = mpsc::channel(100);
        let _ = events_tx.try_send(RpcEvent::Connecting);

        let ws = connect_websocket(&config).await?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Vec<u8>>(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inner = Arc::new(RpcInner {
            config,
            seq: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            outgoing_tx,
            events_tx: Mutex::new(Some(events_tx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run_connection_loop(task_inner, ws, outgoing_rx, shutdown_rx).await;
        });

        Ok((Self { inner }, events_rx))
    }

    /// Whether a connection is currently live.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Close the connection: cancel the task, close the socket and the
    /// event channel. In-flight requests fail by their deadlines.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Fire-and-forget request; returns the stamped sequence number.
    pub async fn send_request(&self, request: AppRequest) -> Result<u32, RpcError> {
        self.inner.send_request(request).await
    }

    /// Request/response with a deadline.
    pub async fn send_request_async(
        &self,
        request: AppRequest,
        timeout: Duration,
    ) -> Result<AppMessage, RpcError> {
        self.inner.send_request_async(request, timeout).await
    }

    /// Register a handler invoked for every inbound frame in registration
    /// order; returning `true` stops propagation to later handlers.
    pub fn add_message_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&AppMessage) -> bool + Send + Sync + 'static,
    {
        self.inner.add_message_handler(Arc::new(handler))
    }

    pub fn remove_message_handler(&self, id: HandlerId) {
        self.inner.remove_message_handler(id);
    }

    /// A handle to a CCTV camera; see [`crate::rpc::camera::Camera`].
    pub fn camera(
        &self,
        identifier: impl Into<String>,
    ) -> (
        crate::rpc::camera::Camera,
        mpsc::Receiver<crate::rpc::camera::CameraEvent>,
    ) {
        crate::rpc::camera::Camera::new(Arc::clone(&self.inner), identifier.into())
    }

    pub async fn get_info(&self) -> Result<AppInfo, RpcError> {
        let request = AppRequest {
            get_info: Some(AppEmpty {}),
            ..Default::default()
        };
        let message = self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        message
            .response
            .and_then(|r| r.info)
            .ok_or(RpcError::InvalidResponse)
    }

    pub async fn get_time(&self) -> Result<AppTime, RpcError> {
        let request = AppRequest {
            get_time: Some(AppEmpty {}),
            ..Default::default()
        };
        let message = self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        message
            .response
            .and_then(|r| r.time)
            .ok_or(RpcError::InvalidResponse)
    }

    pub async fn get_map(&self) -> Result<AppMap, RpcError> {
        let request = AppRequest {
            get_map: Some(AppEmpty {}),
            ..Default::default()
        };
        let message = self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        message
            .response
            .and_then(|r| r.map)
            .ok_or(RpcError::InvalidResponse)
    }

    pub async fn get_team_info(&self) -> Result<AppTeamInfo, RpcError> {
        let request = AppRequest {
            get_team_info: Some(AppEmpty {}),
            ..Default::default()
        };
        let message = self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        message
            .response
            .and_then(|r| r.team_info)
            .ok_or(RpcError::InvalidResponse)
    }

    pub async fn get_team_chat(&self) -> Result<Vec<AppTeamMessage>, RpcError> {
        let request = AppRequest {
            get_team_chat: Some(AppEmpty {}),
            ..Default::default()
        };
        let message = self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        message
            .response
            .and_then(|r| r.team_chat)
            .map(|chat| chat.messages)
            .ok_or(RpcError::InvalidResponse)
    }

    pub async fn send_team_message(&self, text: impl Into<String>) -> Result<(), RpcError> {
        let request = AppRequest {
            send_team_message: Some(AppSendMessage {
                message: Some(text.into()),
            }),
            ..Default::default()
        };
        self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn get_entity_info(&self, entity_id: u32) -> Result<AppEntityInfo, RpcError> {
        let request = AppRequest {
            entity_id: Some(entity_id),
            get_entity_info: Some(AppEmpty {}),
            ..Default::default()
        };
        let message = self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        message
            .response
            .and_then(|r| r.entity_info)
            .ok_or(RpcError::InvalidResponse)
    }

    pub async fn set_entity_value(&self, entity_id: u32, value: bool) -> Result<(), RpcError> {
        let request = AppRequest {
            entity_id: Some(entity_id),
            set_entity_value: Some(AppSetEntityValue { value: Some(value) }),
            ..Default::default()
        };
        self.send_request_async(request, DEFAULT_REQUEST_TIMEOUT).await?;
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.close();
    }
}

async fn connect_websocket(config: &RpcConfig) -> Result<WsStream, RpcError> {
    let url = config.websocket_url();
    log::debug!("connecting to game server: {url}");
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| RpcError::Transport(format!("websocket connect: {e}")))?;
    Ok(ws)
}

async fn run_connection_loop(
    inner: Arc<RpcInner>,
    first: WsStream,
    mut outgoing_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut attempts: u32 = 0;
    let mut current = Some(first);

    loop {
        let ws = match current.take() {
            Some(ws) => ws,
            None => match connect_websocket(&inner.config).await {
                Ok(ws) => ws,
                Err(e) => {
                    log::warn!("reconnect failed: {e}");
                    attempts += 1;
                    if attempts >= RPC_MAX_RECONNECT_ATTEMPTS {
                        log::warn!("giving up after {attempts} reconnect attempts");
                        break;
                    }
                    if !reconnect_backoff(attempts, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            },
        };

        attempts = 0;
        inner.seq.store(0, Ordering::SeqCst);
        inner.connected.store(true, Ordering::SeqCst);
        inner.emit(RpcEvent::Connected);

        let stopped = run_message_loop(&inner, ws, &mut outgoing_rx, &mut shutdown_rx).await;

        inner.connected.store(false, Ordering::SeqCst);
        inner.emit(RpcEvent::Disconnected);
        if stopped {
            break;
        }

        attempts += 1;
        if attempts >= RPC_MAX_RECONNECT_ATTEMPTS {
            log::warn!("giving up after {attempts} reconnect attempts");
            break;
        }
        if !reconnect_backoff(attempts, &mut shutdown_rx).await {
            break;
        }
    }

    // Closing the event channel tells consumers the client is gone.
    inner.events_tx.lock().expect("events channel lock poisoned").take();
}

/// Sleep `attempts` seconds; returns false if shutdown fired meanwhile.
async fn reconnect_backoff(attempts: u32, shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    log::info!("reconnecting to game server in {attempts}s");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(u64::from(attempts))) => true,
        _ = shutdown_rx => false,
    }
}

/// Drive one socket until it fails or shutdown fires. Returns true on
/// shutdown.
async fn run_message_loop(
    inner: &Arc<RpcInner>,
    ws: WsStream,
    outgoing_rx: &mut mpsc::Receiver<Vec<u8>>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            Some(frame) = outgoing_rx.recv() => {
                if let Err(e) = write.send(Message::Binary(frame)).await {
                    log::warn!("socket write failed: {e}");
                    return false;
                }
            }

            incoming = read.next() => match incoming {
                Some(Ok(Message::Binary(data))) => handle_frame(inner, &data),
                Some(Ok(Message::Ping(payload))) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return false;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    log::info!("game server closed the socket");
                    return false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("socket read failed: {e}");
                    return false;
                }
                None => return false,
            },

            _ = &mut *shutdown_rx => {
                let _ = write.send(Message::Close(None)).await;
                return true;
            }
        }
    }
}

/// Dispatch one inbound frame: resolve the pending call (single-shot),
/// then offer the frame to every handler in registration order.
fn handle_frame(inner: &Arc<RpcInner>, data: &[u8]) {
    let message = match AppMessage::decode(data) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("undecodable frame ({} bytes): {e}", data.len());
            return;
        }
    };

    if let Some(seq) = message.response.as_ref().and_then(|r| r.seq) {
        let waiter = inner.pending.lock().expect("pending table lock poisoned").remove(&seq);
        if let Some(tx) = waiter {
            let _ = tx.send(message.clone());
        }
    }

    // Snapshot so a handler may add or remove handlers without deadlock.
    let handlers: Vec<MessageHandler> = inner
        .handlers
        .lock()
        .expect("handlers lock poisoned")
        .iter()
        .map(|(_, handler)| Arc::clone(handler))
        .collect();
    for handler in handlers {
        if handler(&message) {
            break;
        }
    }

    inner.emit(RpcEvent::Message(message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_direct() {
        let config = RpcConfig {
            server: "1.2.3.4".to_string(),
            port: 28083,
            player_id: 76561198000000000,
            player_token: 123456789,
            use_proxy: false,
        };
        assert_eq!(
            config.websocket_url(),
            "ws://1.2.3.4:28083/?playerid=76561198000000000&playertoken=123456789&protocol=2&app=companion"
        );
    }

    #[test]
    fn test_websocket_url_proxy() {
        let config = RpcConfig {
            server: "1.2.3.4".to_string(),
            port: 28083,
            player_id: 7,
            player_token: -5,
            use_proxy: true,
        };
        let url = config.websocket_url();
        assert!(url.starts_with("wss://companion-rust.facepunch.com/game/1.2.3.4/28083?"));
        assert!(url.contains("playertoken=-5"));
    }
}
