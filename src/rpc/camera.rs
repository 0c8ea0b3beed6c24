//! CCTV camera subsystem.
//!
//! A camera is a server-side subscription that streams "ray" frames:
//! batches of RGBA samples whose pixel positions are recovered from a
//! deterministic generator seeded with the frame's sample offset, plus a
//! list of visible 3D entities. Once enough frames accumulate the raster
//! is reconstructed and emitted as a render event.
//!
//! Subscription lifecycle:
//!
//! ```text
//! Unsubscribed → Subscribing → Subscribed → Unsubscribing → Unsubscribed
//! ```
//!
//! While subscribed, a background ticker re-sends the subscribe request
//! every 30 seconds so the server-side subscription never times out; it
//! has a single cancellation point, fired by unsubscribe or drop.

use std::sync::{Arc, Mutex};

use image::{Rgba, RgbaImage};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};

use crate::constants::{CAMERA_REFRESH_INTERVAL, DEFAULT_REQUEST_TIMEOUT, RENDER_FRAME_THRESHOLD};
use crate::rpc::client::{HandlerId, RpcError, RpcInner};
use crate::rpc::proto::{
    AppCameraInfo, AppCameraInput, AppCameraRays, AppCameraSubscribe, AppEmpty, AppRequest,
    RayEntityKind, Vector2,
};

/// Button bitfield values accepted by the camera input operation.
pub mod buttons {
    pub const NONE: i32 = 0;
    pub const FORWARD: i32 = 2;
    pub const BACKWARD: i32 = 4;
    pub const LEFT: i32 = 8;
    pub const RIGHT: i32 = 16;
    pub const JUMP: i32 = 32;
    pub const DUCK: i32 = 64;
    pub const SPRINT: i32 = 128;
    pub const USE: i32 = 256;
    pub const FIRE_PRIMARY: i32 = 1024;
    pub const FIRE_SECONDARY: i32 = 2048;
    pub const RELOAD: i32 = 8192;
    pub const FIRE_THIRD: i32 = 134217728;
}

/// Control-permission bits reported in the camera info.
pub mod control {
    pub const NONE: i32 = 0;
    pub const MOVEMENT: i32 = 1;
    pub const MOUSE: i32 = 2;
    pub const SPRINT_AND_DUCK: i32 = 4;
    pub const FIRE: i32 = 8;
    pub const RELOAD: i32 = 16;
    pub const CROSSHAIR: i32 = 32;
}

/// Camera lifecycle and output events.
#[derive(Debug)]
pub enum CameraEvent {
    Subscribing,
    Subscribed(AppCameraInfo),
    Unsubscribing,
    Unsubscribed,
    /// A reconstructed raster of the subscribed camera.
    Render(RgbaImage),
    Error(String),
}

/// Camera operation failures.
#[derive(Debug)]
pub enum CameraError {
    AlreadySubscribed,
    NotSubscribed,
    /// The subscribe response carried no camera info.
    InvalidResponse,
    Rpc(RpcError),
}

impl std::fmt::Display for CameraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadySubscribed => write!(f, "already subscribed to camera"),
            Self::NotSubscribed => write!(f, "not subscribed to camera"),
            Self::InvalidResponse => write!(f, "invalid camera subscribe response"),
            Self::Rpc(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CameraError {}

impl From<RpcError> for CameraError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

#[derive(Default)]
struct CameraState {
    subscribed: bool,
    info: Option<AppCameraInfo>,
    rays: Vec<AppCameraRays>,
    handler: Option<HandlerId>,
    refresh_stop: Option<oneshot::Sender<()>>,
}

/// Handle to one camera on a connected [`crate::rpc::RpcClient`].
pub struct Camera {
    inner: Arc<RpcInner>,
    identifier: String,
    state: Arc<Mutex<CameraState>>,
    events_tx: mpsc::Sender<CameraEvent>,
}

impl Camera {
    pub(crate) fn new(
        inner: Arc<RpcInner>,
        identifier: String,
    ) -> (Self, mpsc::Receiver<CameraEvent>) {
        let (events_tx, events_rx) = mpsc::channel(100);
        (
            Self {
                inner,
                identifier,
                state: Arc::new(Mutex::new(CameraState::default())),
                events_tx,
            },
            events_rx,
        )
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Geometry and permissions from the last subscribe, if any.
    pub fn subscribe_info(&self) -> Option<AppCameraInfo> {
        self.state.lock().expect("camera state lock poisoned").info.clone()
    }

    /// Whether the camera is a PTZ turret with a crosshair.
    pub fn is_auto_turret(&self) -> bool {
        self.subscribe_info()
            .and_then(|info| info.control_flags)
            .map(|flags| flags & control::CROSSHAIR == control::CROSSHAIR)
            .unwrap_or(false)
    }

    fn subscribe_request(&self) -> AppRequest {
        AppRequest {
            camera_subscribe: Some(AppCameraSubscribe {
                camera_id: Some(self.identifier.clone()),
            }),
            ..Default::default()
        }
    }

    fn emit(&self, event: CameraEvent) {
        if self.events_tx.try_send(event).is_err() {
            log::warn!("camera event channel full, event dropped");
        }
    }

    /// Subscribe to the camera: exchange the subscribe request, store the
    /// returned geometry, start capturing ray broadcasts and arm the
    /// refresh ticker.
    pub async fn subscribe(&self) -> Result<AppCameraInfo, CameraError> {
        if self.state.lock().expect("camera state lock poisoned").subscribed {
            return Err(CameraError::AlreadySubscribed);
        }
        self.emit(CameraEvent::Subscribing);

        let message = match self
            .inner
            .send_request_async(self.subscribe_request(), DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                self.emit(CameraEvent::Error(format!("camera subscribe failed: {e}")));
                return Err(e.into());
            }
        };
        let Some(info) = message.response.and_then(|r| r.camera_subscribe_info) else {
            self.emit(CameraEvent::Error("camera subscribe response carried no info".to_string()));
            return Err(CameraError::InvalidResponse);
        };
        if info.width.unwrap_or(0) <= 0 || info.height.unwrap_or(0) <= 0 {
            self.emit(CameraEvent::Error("camera reported a degenerate frame size".to_string()));
            return Err(CameraError::InvalidResponse);
        }

        // Broadcast handler: capture ray frames for this camera.
        let handler_state = Arc::clone(&self.state);
        let handler_events = self.events_tx.clone();
        let handler = self.inner.add_message_handler(Arc::new(move |message| {
            if let Some(rays) = message
                .broadcast
                .as_ref()
                .and_then(|b| b.camera_rays.as_ref())
            {
                capture_rays(&handler_state, &handler_events, rays.clone());
                return true;
            }
            false
        }));

        // Refresh ticker with a single cancellation point.
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(run_refresh_loop(
            Arc::clone(&self.inner),
            self.subscribe_request(),
            self.events_tx.clone(),
            stop_rx,
        ));

        {
            let mut state = self.state.lock().expect("camera state lock poisoned");
            state.subscribed = true;
            state.info = Some(info.clone());
            state.handler = Some(handler);
            state.refresh_stop = Some(stop_tx);
            state.rays.clear();
        }

        self.emit(CameraEvent::Subscribed(info.clone()));
        Ok(info)
    }

    /// Unsubscribe: cancel the refresh ticker, tell the server, release
    /// the broadcast handler and the ray buffer.
    pub async fn unsubscribe(&self) -> Result<(), CameraError> {
        let (handler, stop) = {
            let mut state = self.state.lock().expect("camera state lock poisoned");
            if !state.subscribed {
                return Err(CameraError::NotSubscribed);
            }
            state.subscribed = false;
            state.rays.clear();
            (state.handler.take(), state.refresh_stop.take())
        };
        self.emit(CameraEvent::Unsubscribing);

        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if let Some(handler) = handler {
            self.inner.remove_message_handler(handler);
        }

        let request = AppRequest {
            camera_unsubscribe: Some(AppEmpty {}),
            ..Default::default()
        };
        if let Err(e) = self
            .inner
            .send_request_async(request, DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            self.emit(CameraEvent::Error(format!("camera unsubscribe failed: {e}")));
            return Err(e.into());
        }

        self.emit(CameraEvent::Unsubscribed);
        Ok(())
    }

    /// Send one movement/input frame: a button bitfield plus a mouse
    /// delta.
    pub async fn move_(&self, buttons: i32, mouse_dx: f32, mouse_dy: f32) -> Result<(), CameraError> {
        if !self.state.lock().expect("camera state lock poisoned").subscribed {
            return Err(CameraError::NotSubscribed);
        }
        let request = AppRequest {
            camera_input: Some(AppCameraInput {
                buttons: Some(buttons),
                mouse_delta: Some(Vector2 {
                    x: Some(mouse_dx),
                    y: Some(mouse_dy),
                }),
            }),
            ..Default::default()
        };
        self.inner
            .send_request_async(request, DEFAULT_REQUEST_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn look_up(&self) -> Result<(), CameraError> {
        self.move_(buttons::NONE, 0.0, -10.0).await
    }

    pub async fn look_down(&self) -> Result<(), CameraError> {
        self.move_(buttons::NONE, 0.0, 10.0).await
    }

    pub async fn look_left(&self) -> Result<(), CameraError> {
        self.move_(buttons::NONE, -10.0, 0.0).await
    }

    pub async fn look_right(&self) -> Result<(), CameraError> {
        self.move_(buttons::NONE, 10.0, 0.0).await
    }

    pub async fn move_forward(&self) -> Result<(), CameraError> {
        self.move_(buttons::FORWARD, 0.0, 0.0).await
    }

    pub async fn move_backward(&self) -> Result<(), CameraError> {
        self.move_(buttons::BACKWARD, 0.0, 0.0).await
    }

    pub async fn move_left(&self) -> Result<(), CameraError> {
        self.move_(buttons::LEFT, 0.0, 0.0).await
    }

    pub async fn move_right(&self) -> Result<(), CameraError> {
        self.move_(buttons::RIGHT, 0.0, 0.0).await
    }

    /// Fire a PTZ turret: press, then release.
    pub async fn shoot(&self) -> Result<(), CameraError> {
        self.move_(buttons::FIRE_PRIMARY, 0.0, 0.0).await?;
        self.move_(buttons::NONE, 0.0, 0.0).await
    }

    /// Zoom a PTZ camera: press the primary fire button, then release.
    pub async fn zoom(&self) -> Result<(), CameraError> {
        self.move_(buttons::FIRE_PRIMARY, 0.0, 0.0).await?;
        self.move_(buttons::NONE, 0.0, 0.0).await
    }

    /// Reload a PTZ turret: press, then release.
    pub async fn reload(&self) -> Result<(), CameraError> {
        self.move_(buttons::RELOAD, 0.0, 0.0).await?;
        self.move_(buttons::NONE, 0.0, 0.0).await
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("camera state lock poisoned");
        if let Some(stop) = state.refresh_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handler) = state.handler.take() {
            self.inner.remove_message_handler(handler);
        }
    }
}

/// Re-send the subscribe request on a fixed cadence until stopped.
async fn run_refresh_loop(
    inner: Arc<RpcInner>,
    request: AppRequest,
    events_tx: mpsc::Sender<CameraEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(
        Instant::now() + CAMERA_REFRESH_INTERVAL,
        CAMERA_REFRESH_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner
                    .send_request_async(request.clone(), DEFAULT_REQUEST_TIMEOUT)
                    .await
                {
                    log::warn!("camera resubscribe failed: {e}");
                    let _ = events_tx.try_send(CameraEvent::Error(format!(
                        "camera resubscribe failed: {e}"
                    )));
                }
            }
            _ = &mut stop_rx => break,
        }
    }
}

/// Accumulate one ray frame; render and flush once the threshold is hit.
fn capture_rays(
    state: &Mutex<CameraState>,
    events_tx: &mpsc::Sender<CameraEvent>,
    rays: AppCameraRays,
) {
    let image = {
        let mut state = state.lock().expect("camera state lock poisoned");
        state.rays.push(rays);
        if state.rays.len() < RENDER_FRAME_THRESHOLD {
            return;
        }
        let Some(info) = state.info.clone() else {
            state.rays.clear();
            return;
        };
        let frames = std::mem::take(&mut state.rays);
        render_frames(&info, &frames)
    };

    match image {
        Some(image) => {
            if events_tx.try_send(CameraEvent::Render(image)).is_err() {
                log::warn!("camera event channel full, render dropped");
            }
        }
        None => {
            let _ = events_tx.try_send(CameraEvent::Error(
                "camera info missing a usable frame size".to_string(),
            ));
        }
    }
}

/// Reconstruct an RGBA raster from accumulated ray frames.
fn render_frames(info: &AppCameraInfo, frames: &[AppCameraRays]) -> Option<RgbaImage> {
    let width = info.width.unwrap_or(0);
    let height = info.height.unwrap_or(0);
    if width <= 0 || height <= 0 {
        return None;
    }
    let (width, height) = (width as u32, height as u32);

    let mut image = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));

    for frame in frames {
        let data = frame.ray_data.as_deref().unwrap_or(&[]);
        let mut generator = IndexGenerator::new(frame.sample_offset.unwrap_or(0));

        for sample in data.chunks_exact(4) {
            let x = generator.next_int(width);
            let y = generator.next_int(height);
            if x < width && y < height {
                image.put_pixel(x, y, Rgba([sample[0], sample[1], sample[2], sample[3]]));
            }
        }

        for entity in &frame.entities {
            let Some(position) = &entity.position else {
                continue;
            };
            let depth = -position.z.unwrap_or(0.0);
            if depth <= 0.0 {
                continue;
            }

            let x = position.x.unwrap_or(0.0);
            let y = position.y.unwrap_or(0.0);
            let screen_x = ((x / depth) * width as f32 * 0.5 + width as f32 * 0.5).round() as i64;
            let screen_y = ((-y / depth) * height as f32 * 0.5 + height as f32 * 0.5).round() as i64;
            if screen_x < 0 || screen_x >= i64::from(width) || screen_y < 0 || screen_y >= i64::from(height)
            {
                continue;
            }

            let size = entity.size.clone().unwrap_or_default();
            let extent =
                size.x.unwrap_or(0.0) + size.y.unwrap_or(0.0) + size.z.unwrap_or(0.0);
            let radius = ((extent / 3.0) as i64).clamp(5, 20);

            let color = match RayEntityKind::try_from(entity.kind.unwrap_or(0)) {
                Ok(RayEntityKind::Player) => Rgba([255, 0, 0, 255]),
                Ok(RayEntityKind::Tree) => Rgba([0, 255, 0, 255]),
                _ => Rgba([255, 255, 0, 255]),
            };
            fill_disc(&mut image, screen_x, screen_y, radius, color);
        }
    }

    Some(image)
}

fn fill_disc(image: &mut RgbaImage, cx: i64, cy: i64, radius: i64, color: Rgba<u8>) {
    let (width, height) = (i64::from(image.width()), i64::from(image.height()));
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let (px, py) = (cx + dx, cy + dy);
            if px >= 0 && px < width && py >= 0 && py < height {
                image.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

/// Deterministic xorshift32 index generator.
///
/// Seeded with a frame's sample offset and advanced once immediately;
/// each `next_int` consumes the pre-advance state. The arithmetic is
/// done in unsigned 64-bit, so the negative-result correction the
/// upstream 32-bit-signed implementation needed can never trigger here.
struct IndexGenerator {
    state: u32,
}

impl IndexGenerator {
    fn new(seed: u32) -> Self {
        let mut generator = Self { state: seed };
        generator.next_state();
        generator
    }

    fn next_state(&mut self) -> u32 {
        let t = self.state;
        let mut e = t ^ (t << 13);
        e ^= e >> 17;
        e ^= e << 5;
        self.state = e;
        t
    }

    fn next_int(&mut self, max: u32) -> u32 {
        ((u64::from(self.next_state()) * u64::from(max)) / 4_294_967_295) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::proto::{RayEntity, Vector3};

    #[test]
    fn test_prng_seed_one_vector() {
        let mut generator = IndexGenerator::new(1);
        let values: Vec<u32> = (0..5).map(|_| generator.next_int(100)).collect();
        assert_eq!(values, vec![0, 1, 61, 7, 55]);
    }

    #[test]
    fn test_prng_discards_seed_state() {
        // The constructor advances once: the first state consumed by
        // next_int is xorshift32(seed), not the seed itself.
        let mut generator = IndexGenerator::new(1);
        assert_eq!(generator.next_state(), 270369);
    }

    #[test]
    fn test_prng_determinism_across_instances() {
        let a: Vec<u32> = {
            let mut g = IndexGenerator::new(1337);
            (0..16).map(|_| g.next_int(160)).collect()
        };
        let b: Vec<u32> = {
            let mut g = IndexGenerator::new(1337);
            (0..16).map(|_| g.next_int(160)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_button_bits() {
        assert_eq!(buttons::NONE, 0);
        assert_eq!(buttons::FORWARD, 2);
        assert_eq!(buttons::BACKWARD, 4);
        assert_eq!(buttons::LEFT, 8);
        assert_eq!(buttons::RIGHT, 16);
        assert_eq!(buttons::JUMP, 32);
        assert_eq!(buttons::DUCK, 64);
        assert_eq!(buttons::SPRINT, 128);
        assert_eq!(buttons::USE, 256);
        assert_eq!(buttons::FIRE_PRIMARY, 1024);
        assert_eq!(buttons::FIRE_SECONDARY, 2048);
        assert_eq!(buttons::RELOAD, 8192);
        assert_eq!(buttons::FIRE_THIRD, 134217728);
    }

    fn info(width: i32, height: i32) -> AppCameraInfo {
        AppCameraInfo {
            width: Some(width),
            height: Some(height),
            control_flags: Some(control::NONE),
            ..Default::default()
        }
    }

    #[test]
    fn test_render_places_samples_deterministically() {
        // seed 3: the first (x, y) pair for a 160x90 frame is (0, 4).
        let frame = AppCameraRays {
            sample_offset: Some(3),
            ray_data: Some(vec![255, 0, 0, 255]),
            ..Default::default()
        };
        let image = render_frames(&info(160, 90), &[frame]).unwrap();
        assert_eq!(image.dimensions(), (160, 90));
        assert_eq!(image.get_pixel(0, 4), &Rgba([255, 0, 0, 255]));
        assert_eq!(image.get_pixel(1, 1), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_render_entity_behind_camera_draws_nothing() {
        let frame = AppCameraRays {
            entities: vec![RayEntity {
                kind: Some(RayEntityKind::Player as i32),
                position: Some(Vector3 {
                    x: Some(0.0),
                    y: Some(0.0),
                    z: Some(5.0), // depth = -5, behind the camera
                }),
                size: Some(Vector3 {
                    x: Some(10.0),
                    y: Some(10.0),
                    z: Some(10.0),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let image = render_frames(&info(64, 64), &[frame]).unwrap();
        assert!(image.pixels().all(|p| p == &Rgba([0, 0, 0, 255])));
    }

    #[test]
    fn test_render_entity_disc_color_and_radius_clamp() {
        let entity = |kind: i32, x: f32| RayEntity {
            kind: Some(kind),
            position: Some(Vector3 {
                x: Some(x),
                y: Some(0.0),
                z: Some(-10.0),
            }),
            // Tiny extents clamp the disc radius up to 5.
            size: Some(Vector3 {
                x: Some(1.0),
                y: Some(1.0),
                z: Some(1.0),
            }),
            ..Default::default()
        };

        let frame = AppCameraRays {
            entities: vec![
                entity(RayEntityKind::Player as i32, -5.0),
                entity(RayEntityKind::Tree as i32, 0.0),
                entity(99, 5.0),
            ],
            ..Default::default()
        };
        let image = render_frames(&info(128, 128), &[frame]).unwrap();

        // screen_x = (x / 10) * 64 + 64, screen_y = 64.
        assert_eq!(image.get_pixel(32, 64), &Rgba([255, 0, 0, 255]));
        assert_eq!(image.get_pixel(64, 64), &Rgba([0, 255, 0, 255]));
        assert_eq!(image.get_pixel(96, 64), &Rgba([255, 255, 0, 255]));
        // Radius clamps to 5: inside the disc at distance 5, outside at 6.
        assert_eq!(image.get_pixel(32, 69), &Rgba([255, 0, 0, 255]));
        assert_eq!(image.get_pixel(32, 70), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_capture_renders_on_tenth_frame_and_flushes() {
        let state = Mutex::new(CameraState {
            subscribed: true,
            info: Some(info(16, 16)),
            ..Default::default()
        });
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let frame = AppCameraRays {
            sample_offset: Some(1),
            ray_data: Some(vec![10, 20, 30, 255]),
            ..Default::default()
        };

        for _ in 0..RENDER_FRAME_THRESHOLD - 1 {
            capture_rays(&state, &events_tx, frame.clone());
        }
        assert!(events_rx.try_recv().is_err());
        assert_eq!(state.lock().unwrap().rays.len(), RENDER_FRAME_THRESHOLD - 1);

        capture_rays(&state, &events_tx, frame.clone());
        match events_rx.try_recv() {
            Ok(CameraEvent::Render(image)) => assert_eq!(image.dimensions(), (16, 16)),
            other => panic!("expected render event, got {other:?}"),
        }
        assert!(events_rx.try_recv().is_err(), "exactly one render event");
        assert!(state.lock().unwrap().rays.is_empty(), "ray buffer flushed");
    }

    #[test]
    fn test_render_with_degenerate_size_is_none() {
        assert!(render_frames(&info(0, 90), &[]).is_none());
        assert!(render_frames(&info(160, -1), &[]).is_none());
    }
}
