//! Protocol endpoints and tuning constants shared across the crate.

use std::time::Duration;

/// Hostname of the mobile-push relay.
pub const MCS_HOST: &str = "mtalk.google.com";

/// Port of the mobile-push relay.
pub const MCS_PORT: u16 = 5228;

/// Current MCS framing version byte.
pub const MCS_VERSION: u8 = 41;

/// Legacy MCS framing version still accepted on the wire.
pub const MCS_LEGACY_VERSION: u8 = 38;

/// Check-in endpoint (protobuf over HTTPS).
pub const CHECKIN_URL: &str = "https://android.clients.google.com/checkin";

/// C2DM-style registration endpoint (form-encoded).
pub const REGISTER_URL: &str = "https://android.clients.google.com/c2dm/register3";

/// Expo push-token exchange endpoint.
pub const EXPO_PUSH_TOKEN_URL: &str = "https://exp.host/--/api/v2/push/getExpoPushToken";

/// Companion-API push registration endpoint.
pub const COMPANION_REGISTER_URL: &str = "https://companion-rust.facepunch.com:443/api/push/register";

/// Host of the HTTPS game-server proxy.
pub const COMPANION_PROXY_HOST: &str = "companion-rust.facepunch.com";

/// Chrome version declared during check-in and login.
pub const CHROME_VERSION: &str = "63.0.3234.0";

/// Firebase Installations endpoint for a project.
pub fn installations_url(project_id: &str) -> String {
    format!("https://firebaseinstallations.googleapis.com/v1/projects/{project_id}/installations")
}

/// Registration retries when the relay answers with an `Error` body.
pub const REGISTER_MAX_RETRIES: u32 = 5;

/// Spacing between registration retries.
pub const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Cap on the MCS reconnect backoff, in seconds.
pub const MCS_MAX_BACKOFF_SECS: u64 = 15;

/// RPC reconnect attempts before the connection loop gives up.
pub const RPC_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Deadline applied to the typed RPC convenience requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval at which a subscribed camera re-arms its server subscription.
pub const CAMERA_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Ray frames accumulated before an image is reconstructed.
pub const RENDER_FRAME_THRESHOLD: usize = 10;

/// Default WebPush record size.
pub const DEFAULT_RECORD_SIZE: usize = 4096;

/// Loopback port for the auth capture endpoint.
pub const AUTH_CAPTURE_PORT: u16 = 3000;

/// Overall deadline for the auth capture flow.
pub const AUTH_CAPTURE_DEADLINE: Duration = Duration::from_secs(300);
