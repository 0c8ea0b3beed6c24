//! gamelink - companion push receiver and game-server RPC client.
//!
//! Two protocol engines share this crate:
//!
//! - **Push**: a long-lived TLS session against the mobile-push relay
//!   that decodes framed records, decrypts WebPush payloads and fans
//!   decoded notifications out to the consumer ([`push`]).
//! - **RPC**: a WebSocket client for the game server multiplexing
//!   sequenced request/response traffic with server broadcasts, hosting
//!   the CCTV camera subsystem ([`rpc`]).
//!
//! Around them: the registration flows that mint [`credentials`], the
//! [`pairing`] notification parser bridging the two engines, and the
//! loopback [`auth`] capture endpoint used during account linking.

pub mod auth;
pub mod constants;
pub mod credentials;
pub mod pairing;
pub mod push;
pub mod rpc;

pub use credentials::Credentials;
pub use pairing::{parse_pairing_notification, ServerPairing};
pub use push::{Notification, PushClient, PushConfig, PushEvent};
pub use rpc::{Camera, CameraEvent, RpcClient, RpcConfig, RpcEvent};
