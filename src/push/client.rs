//! Long-lived push session against the mobile relay.
//!
//! One background task owns the TLS connection and drives it through a
//! reconnect loop:
//!
//! ```text
//! PushClient
//!     ├── check-in (re-authenticate the device identity)
//!     ├── TLS dial + LoginRequest frame
//!     ├── frame decoder → control handling / notification fan-out
//!     └── reconnect with min(retries, 15)s backoff
//! ```
//!
//! Decoded notifications preserve the relay's arrival order and are
//! delivered on an unbounded channel; the reader never blocks on the
//! consumer. `stop()` cancels the loop, closes the socket and closes the
//! event channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::constants::{CHROME_VERSION, MCS_HOST, MCS_MAX_BACKOFF_SECS, MCS_PORT};
use crate::credentials::Credentials;
use crate::push::ece::{self, EncryptedMessage};
use crate::push::mcs::{
    AuthService, DataMessageStanza, HeartbeatAck, LoginRequest, McsMessage, Setting,
};
use crate::push::parser::{FrameEvent, McsDecoder};
use crate::push::register;

/// Configuration of a push session.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub credentials: Credentials,
    /// Persistent ids already delivered, replayed at login.
    pub persistent_ids: Vec<String>,
}

/// A received push record, decrypted where possible.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    /// Decoded notification object, or `{"raw":true,…}` for records that
    /// carried no decryptable payload.
    pub message: serde_json::Value,
    #[serde(rename = "persistentId")]
    pub persistent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Session lifecycle events delivered alongside notifications.
#[derive(Debug)]
pub enum PushEvent {
    Connected,
    Disconnected,
    Notification(Notification),
}

/// Errors surfaced by [`PushClient::connect`].
#[derive(Debug)]
pub enum PushError {
    /// The device identity is unusable.
    Credentials(String),
    /// Check-in was rejected.
    CheckIn(String),
    /// The relay could not be reached or the stream failed.
    Transport(String),
}

impl std::fmt::Display for PushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credentials(msg) => write!(f, "invalid credentials: {msg}"),
            Self::CheckIn(msg) => write!(f, "check-in failed: {msg}"),
            Self::Transport(msg) => write!(f, "transport failed: {msg}"),
        }
    }
}

impl std::error::Error for PushError {}

struct PushInner {
    android_id: String,
    security_token: String,
    android_id_num: u64,
    security_token_num: u64,
    keys: Option<ece::Keys>,
    persistent_ids: Mutex<HashSet<String>>,
    http: reqwest::Client,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// Handle to a live push session.
pub struct PushClient {
    inner: Arc<PushInner>,
}

impl PushClient {
    /// Check in, dial the relay and spawn the session task.
    ///
    /// # Errors
    ///
    /// Fails if the credentials are unusable or the initial check-in or
    /// dial fails; once connected, transient errors are handled by the
    /// reconnect loop instead.
    pub async fn connect(
        config: PushConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PushEvent>), PushError> {
        let android_id_num: u64 = config
            .credentials
            .gcm
            .android_id
            .parse()
            .map_err(|_| PushError::Credentials("androidId is not a decimal u64".to_string()))?;
        let security_token_num: u64 = config
            .credentials
            .gcm
            .security_token
            .parse()
            .map_err(|_| PushError::Credentials("securityToken is not a decimal u64".to_string()))?;

        let keys = (!config.credentials.fcm.keys.private.is_empty()).then(|| ece::Keys {
            private_key: config.credentials.fcm.keys.private.clone(),
            auth_secret: config.credentials.fcm.keys.auth.clone(),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inner = Arc::new(PushInner {
            android_id: config.credentials.gcm.android_id.clone(),
            security_token: config.credentials.gcm.security_token.clone(),
            android_id_num,
            security_token_num,
            keys,
            persistent_ids: Mutex::new(config.persistent_ids.into_iter().collect()),
            http: reqwest::Client::new(),
            shutdown: Mutex::new(Some(shutdown_tx)),
        });

        // The first connection is established here so startup failures
        // surface to the caller instead of vanishing into the retry loop.
        let stream = establish(&inner).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run_session_loop(task_inner, stream, events_tx, shutdown_rx).await;
        });

        Ok((Self { inner }, events_rx))
    }

    /// Stop the session: cancel the loop, close the socket, close the
    /// event channel. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.inner.shutdown.lock().expect("shutdown lock poisoned").take() {
            let _ = tx.send(());
        }
    }

    /// Persistent ids accumulated in this session.
    pub fn persistent_ids(&self) -> Vec<String> {
        self.inner
            .persistent_ids
            .lock()
            .expect("persistent-id set lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl Drop for PushClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Check in, dial TLS and send the login frame.
async fn establish(inner: &PushInner) -> Result<TlsStream<TcpStream>, PushError> {
    register::check_in(
        &inner.http,
        Some(inner.android_id_num),
        Some(inner.security_token_num),
    )
    .await
    .map_err(|e| PushError::CheckIn(format!("{e:#}")))?;

    let tcp = TcpStream::connect((MCS_HOST, MCS_PORT))
        .await
        .map_err(|e| PushError::Transport(format!("dial: {e}")))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(MCS_HOST).expect("relay host is a valid dns name");

    let mut stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| PushError::Transport(format!("tls handshake: {e}")))?;

    let login = build_login_frame(inner);
    stream
        .write_all(&login)
        .await
        .map_err(|e| PushError::Transport(format!("login write: {e}")))?;

    Ok(stream)
}

/// The LoginRequest frame that opens every connection, replaying the
/// current persistent-id set.
fn build_login_frame(inner: &PushInner) -> Vec<u8> {
    let received: Vec<String> = inner
        .persistent_ids
        .lock()
        .expect("persistent-id set lock poisoned")
        .iter()
        .cloned()
        .collect();

    let request = LoginRequest {
        adaptive_heartbeat: Some(false),
        auth_service: Some(AuthService::AndroidId as i32),
        auth_token: Some(inner.security_token.clone()),
        id: Some(format!("chrome-{CHROME_VERSION}")),
        domain: Some("mcs.android.com".to_string()),
        device_id: Some(format!("android-{:x}", inner.android_id_num)),
        network_type: Some(1),
        resource: Some(inner.android_id.clone()),
        user: Some(inner.android_id.clone()),
        use_rmq2: Some(true),
        setting: vec![Setting {
            name: Some("new_vc".to_string()),
            value: Some("1".to_string()),
        }],
        received_persistent_id: received,
        ..Default::default()
    };

    McsMessage::LoginRequest(request).encode_frame(true)
}

async fn run_session_loop(
    inner: Arc<PushInner>,
    first_stream: TlsStream<TcpStream>,
    events_tx: mpsc::UnboundedSender<PushEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut retries: u64 = 0;
    let mut stream = Some(first_stream);

    loop {
        let conn = match stream.take() {
            Some(conn) => conn,
            None => match establish(&inner).await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("reconnect failed: {e}");
                    retries += 1;
                    if !backoff(retries, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            },
        };

        retries = 0;
        let _ = events_tx.send(PushEvent::Connected);
        let stopped = read_session(&inner, conn, &events_tx, &mut shutdown_rx).await;
        let _ = events_tx.send(PushEvent::Disconnected);
        if stopped {
            break;
        }

        retries += 1;
        if !backoff(retries, &mut shutdown_rx).await {
            break;
        }
    }
    // Dropping events_tx closes the consumer channel.
}

/// Sleep for the bounded backoff; returns false if shutdown fired.
async fn backoff(retries: u64, shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    let secs = retries.min(MCS_MAX_BACKOFF_SECS);
    log::info!("reconnecting to push relay in {secs}s");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(secs)) => true,
        _ = shutdown_rx => false,
    }
}

/// Drive one connection until it fails or shutdown fires. Returns true
/// on shutdown.
async fn read_session(
    inner: &PushInner,
    mut stream: TlsStream<TcpStream>,
    events_tx: &mpsc::UnboundedSender<PushEvent>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> bool {
    let mut decoder = McsDecoder::new();
    let mut session = SessionState::new();
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = match read {
                    Ok(0) => {
                        log::warn!("push relay closed the stream");
                        return false;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        log::warn!("push stream read error: {e}");
                        return false;
                    }
                };

                let events = match decoder.feed(&buf[..n]) {
                    Ok(events) => events,
                    Err(e) => {
                        log::warn!("fatal framing error: {e}");
                        return false;
                    }
                };

                for event in events {
                    match session.handle_event(inner, event, events_tx) {
                        SessionAction::Continue => {}
                        SessionAction::SendAck(ack) => {
                            let frame = McsMessage::HeartbeatAck(ack).encode_frame(false);
                            if let Err(e) = stream.write_all(&frame).await {
                                log::warn!("heartbeat ack write failed: {e}");
                                return false;
                            }
                        }
                        SessionAction::Reconnect => return false,
                    }
                }
            }
            _ = &mut *shutdown_rx => {
                let _ = stream.shutdown().await;
                return true;
            }
        }
    }
}

/// What the connection loop should do after a frame.
#[derive(Debug)]
enum SessionAction {
    Continue,
    SendAck(HeartbeatAck),
    Reconnect,
}

/// Per-connection handshake bookkeeping and frame dispatch.
struct SessionState {
    handshake_complete: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            handshake_complete: false,
        }
    }

    fn handle_event(
        &mut self,
        inner: &PushInner,
        event: FrameEvent,
        events_tx: &mpsc::UnboundedSender<PushEvent>,
    ) -> SessionAction {
        let message = match event {
            FrameEvent::Message(message) => message,
            FrameEvent::UnknownTag { tag, len } => {
                log::warn!("skipped unknown tag {tag} ({len} bytes)");
                return SessionAction::Continue;
            }
            FrameEvent::Malformed { tag, error } => {
                log::warn!("undecodable payload for tag {tag:?}: {error}");
                return SessionAction::Continue;
            }
        };

        match message {
            McsMessage::LoginResponse(response) => {
                if let Some(error) = response.error {
                    log::warn!(
                        "login rejected: code {:?}, {:?}",
                        error.code,
                        error.message
                    );
                    return SessionAction::Reconnect;
                }
                if self.handshake_complete {
                    log::warn!("unexpected second login response");
                } else {
                    self.handshake_complete = true;
                    // The replayed ids are acknowledged by the login.
                    inner
                        .persistent_ids
                        .lock()
                        .expect("persistent-id set lock poisoned")
                        .clear();
                    log::info!(
                        "push handshake complete (server time {:?})",
                        response.server_timestamp
                    );
                }
                SessionAction::Continue
            }
            McsMessage::DataMessage(stanza) => {
                if let Some(notification) = process_data_message(inner, stanza) {
                    let _ = events_tx.send(PushEvent::Notification(notification));
                }
                SessionAction::Continue
            }
            McsMessage::HeartbeatPing(ping) => SessionAction::SendAck(HeartbeatAck {
                stream_id: None,
                last_stream_id_received: ping.stream_id,
                status: ping.status,
            }),
            McsMessage::Close(_) => {
                log::info!("relay sent close");
                SessionAction::Reconnect
            }
            McsMessage::StreamError(err) => {
                log::warn!("stream error: {:?} {:?}", err.kind, err.text);
                SessionAction::Reconnect
            }
            other => {
                log::debug!("ignoring control message {:?}", other.tag());
                SessionAction::Continue
            }
        }
    }
}

/// How a data record should reach the consumer.
enum RecordOutcome {
    DeliverDecoded(serde_json::Value),
    DeliverRaw { decrypt_failed: bool },
    Drop,
}

/// Dedup, decrypt and classify one data record.
fn process_data_message(inner: &PushInner, stanza: DataMessageStanza) -> Option<Notification> {
    let persistent_id = stanza.persistent_id.clone().unwrap_or_default();

    {
        let mut ids = inner
            .persistent_ids
            .lock()
            .expect("persistent-id set lock poisoned");
        if !persistent_id.is_empty() {
            if ids.contains(&persistent_id) {
                return None;
            }
            // Dedupe every classified record, delivered or dropped.
            ids.insert(persistent_id.clone());
        }
    }

    let outcome = classify_record(inner.keys.as_ref(), &stanza);
    let message = match outcome {
        RecordOutcome::DeliverDecoded(value) => value,
        RecordOutcome::DeliverRaw { decrypt_failed } => {
            let mut raw = serde_json::json!({ "raw": true });
            if decrypt_failed {
                raw["decryptFailed"] = serde_json::Value::Bool(true);
            }
            raw
        }
        RecordOutcome::Drop => return None,
    };

    Some(Notification {
        message,
        persistent_id,
        from: stanza.from,
        token: stanza.token,
    })
}

fn classify_record(keys: Option<&ece::Keys>, stanza: &DataMessageStanza) -> RecordOutcome {
    let find = |name: &str| {
        stanza
            .app_data
            .iter()
            .find(|item| item.key.as_deref() == Some(name))
            .and_then(|item| item.value.clone())
    };

    let crypto_key = find("crypto-key");
    if crypto_key.is_none() {
        return RecordOutcome::DeliverRaw {
            decrypt_failed: false,
        };
    }

    let Some(keys) = keys else {
        return RecordOutcome::DeliverRaw {
            decrypt_failed: true,
        };
    };

    let message = EncryptedMessage {
        crypto_key,
        encryption: find("encryption"),
        raw_data: stanza.raw_data.clone().unwrap_or_default(),
    };

    match ece::decrypt_message(&message, keys) {
        Ok(value) => RecordOutcome::DeliverDecoded(value),
        Err(e) if e.is_ignorable() => {
            log::info!("record dropped, not decryptable: {e}");
            RecordOutcome::Drop
        }
        Err(e) => {
            log::warn!("record decryption failed: {e}");
            RecordOutcome::DeliverRaw {
                decrypt_failed: true,
            }
        }
    }
}
