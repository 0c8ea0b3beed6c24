//! Loopback auth-capture endpoint.
//!
//! A short-lived HTTP server that receives the bearer token a browser
//! redirect posts back after the user signs in:
//!
//! - `GET /` serves the embedded pairing page.
//! - `POST /callback` accepts `{"token":"…"}` JSON or `token=…` form
//!   data and replies `{"success":true}` with permissive CORS.
//! - `GET /callback?token=…` accepts the redirect form, plaintext reply.
//! - `OPTIONS /callback` answers the CORS preflight.
//!
//! Exactly one token is delivered; later submissions are dropped. The
//! whole flow is bounded by a five-minute deadline, and shutdown is
//! idempotent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use tokio::sync::oneshot;

use crate::constants::{AUTH_CAPTURE_DEADLINE, AUTH_CAPTURE_PORT};

const PAIR_PAGE: &str = include_str!("../assets/pair.html");

const CORS_HEADERS: [(HeaderName, &str); 3] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
];

#[derive(Clone)]
struct CaptureState {
    /// Single-fire sender; the first token takes it, later ones find None.
    token_tx: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl CaptureState {
    /// Deliver a token to the waiting flow. Returns false once spent.
    fn deliver(&self, token: String) -> bool {
        match self.token_tx.lock().expect("token channel lock poisoned").take() {
            Some(tx) => tx.send(token).is_ok(),
            None => false,
        }
    }
}

/// A bound auth-capture server waiting for one token.
pub struct AuthCapture {
    addr: SocketAddr,
    token_rx: oneshot::Receiver<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AuthCapture {
    /// Bind the capture server on the standard loopback port.
    pub async fn bind_default() -> Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], AUTH_CAPTURE_PORT))).await
    }

    /// Bind the capture server on an explicit address.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let (token_tx, token_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = CaptureState {
            token_tx: Arc::new(Mutex::new(Some(token_tx))),
        };
        let app = Router::new()
            .route("/", get(index))
            .route(
                "/callback",
                get(callback_get).post(callback_post).options(callback_options),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind auth capture server on {addr}"))?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                log::warn!("auth capture server error: {e}");
            }
        });

        Ok(Self {
            addr,
            token_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the token, bounded by `deadline`; the server shuts down
    /// either way.
    pub async fn wait_for_token(mut self, deadline: Duration) -> Result<String> {
        let outcome = tokio::time::timeout(deadline, &mut self.token_rx).await;
        self.shutdown();
        match outcome {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(_)) => bail!("auth capture server closed before a token arrived"),
            Err(_) => bail!("timed out waiting for authentication"),
        }
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for AuthCapture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the whole flow on the standard port with the standard deadline.
pub async fn capture_auth_token() -> Result<String> {
    let capture = AuthCapture::bind_default().await?;
    log::info!("auth capture listening on http://{}", capture.addr());
    capture.wait_for_token(AUTH_CAPTURE_DEADLINE).await
}

async fn index() -> Html<&'static str> {
    Html(PAIR_PAGE)
}

async fn callback_post(State(state): State<CaptureState>, body: String) -> impl IntoResponse {
    let token = token_from_body(&body);
    match token {
        Some(token) => {
            if !state.deliver(token) {
                log::info!("auth token already captured, extra submission dropped");
            }
            (
                StatusCode::OK,
                CORS_HEADERS,
                axum::Json(serde_json::json!({ "success": true })),
            )
                .into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            CORS_HEADERS,
            "Token missing from request!",
        )
            .into_response(),
    }
}

async fn callback_get(
    State(state): State<CaptureState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match params.get("token").filter(|t| !t.is_empty()) {
        Some(token) => {
            if !state.deliver(token.clone()) {
                log::info!("auth token already captured, extra submission dropped");
            }
            (StatusCode::OK, "Success! You can now close this window.").into_response()
        }
        None => (StatusCode::BAD_REQUEST, "Token missing from request!").into_response(),
    }
}

async fn callback_options() -> impl IntoResponse {
    (StatusCode::OK, CORS_HEADERS, ())
}

/// Pull the token out of a `{"token":…}` JSON body or a form body.
fn token_from_body(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(token) = value.get("token").and_then(|t| t.as_str()) {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
        return None;
    }
    let form: HashMap<String, String> = serde_urlencoded::from_str(body).ok()?;
    form.get("token")
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_from_json_body() {
        assert_eq!(
            token_from_body(r#"{"token":"abc123"}"#),
            Some("abc123".to_string())
        );
        assert_eq!(token_from_body(r#"{"token":""}"#), None);
        assert_eq!(token_from_body(r#"{"other":"x"}"#), None);
    }

    #[test]
    fn test_token_from_form_body() {
        assert_eq!(
            token_from_body("token=abc%3D123&extra=1"),
            Some("abc=123".to_string())
        );
        assert_eq!(token_from_body("nothing=here"), None);
    }

    #[tokio::test]
    async fn test_capture_round_trip_post_json() {
        let capture = AuthCapture::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = capture.addr();

        let client = reqwest::Client::new();
        tokio::spawn(async move {
            let response = client
                .post(format!("http://{addr}/callback"))
                .json(&serde_json::json!({ "token": "steam-token-1" }))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
            assert_eq!(
                response
                    .headers()
                    .get("access-control-allow-origin")
                    .unwrap(),
                "*"
            );
            let body: serde_json::Value = response.json().await.unwrap();
            assert_eq!(body["success"], true);
        });

        let token = capture
            .wait_for_token(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(token, "steam-token-1");
    }

    #[tokio::test]
    async fn test_capture_get_query_and_single_fire() {
        let capture = AuthCapture::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = capture.addr();

        let client = reqwest::Client::new();
        let requests = tokio::spawn(async move {
            let first = client
                .get(format!("http://{addr}/callback?token=first"))
                .send()
                .await
                .unwrap();
            assert_eq!(first.status(), 200);
            // A second token is accepted over HTTP but dropped internally.
            let second = client
                .get(format!("http://{addr}/callback?token=second"))
                .send()
                .await
                .unwrap();
            assert_eq!(second.status(), 200);
        });

        let token = capture
            .wait_for_token(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(token, "first");
        requests.await.unwrap();
    }

    #[tokio::test]
    async fn test_preflight_and_index() {
        let capture = AuthCapture::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = capture.addr();

        let client = reqwest::Client::new();
        let preflight = client
            .request(reqwest::Method::OPTIONS, format!("http://{addr}/callback"))
            .send()
            .await
            .unwrap();
        assert_eq!(preflight.status(), 200);
        assert_eq!(
            preflight
                .headers()
                .get("access-control-allow-methods")
                .unwrap(),
            "POST, OPTIONS"
        );

        let index = client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        assert!(index.text().await.unwrap().contains("Link your account"));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let capture = AuthCapture::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let err = capture
            .wait_for_token(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let capture = AuthCapture::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = capture.addr();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/callback"))
            .body("unrelated=1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        drop(capture);
    }
}
