//! Game-server RPC engine.
//!
//! - [`proto`] — request/response/broadcast frame types
//! - [`client`] — the sequenced WebSocket client
//! - [`camera`] — the CCTV camera subsystem

pub mod camera;
pub mod client;
pub mod proto;

pub use camera::{Camera, CameraError, CameraEvent};
pub use client::{HandlerId, RpcClient, RpcConfig, RpcError, RpcEvent};
