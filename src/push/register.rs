//! Check-in and registration flows.
//!
//! One-shot HTTP exchanges that mint the credentials blob:
//!
//! 1. Check-in (protobuf over HTTPS) issues or re-authenticates a device
//!    identity: a 64-bit android id plus its security token.
//! 2. A C2DM-style form registration exchanges that identity for a
//!    per-app routing token. The relay occasionally answers with a body
//!    containing `Error`; such responses are retried up to five times at
//!    one-second spacing.
//! 3. The Android path first creates a Firebase installation (JSON) whose
//!    short-lived auth token accompanies the registration form.
//!
//! The WebPush key material (P-256 keypair + 16-byte auth secret) is
//! generated locally and never leaves the machine.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use p256::SecretKey;
use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;

use crate::constants::{
    CHECKIN_URL, CHROME_VERSION, COMPANION_REGISTER_URL, EXPO_PUSH_TOKEN_URL, REGISTER_MAX_RETRIES,
    REGISTER_RETRY_DELAY, REGISTER_URL,
};
use crate::credentials::{Credentials, FcmCredentials, FcmKeys, GcmCredentials};

#[derive(Clone, PartialEq, Message)]
struct ChromeBuild {
    #[prost(int32, optional, tag = "1")]
    platform: Option<i32>,
    #[prost(string, optional, tag = "2")]
    chrome_version: Option<String>,
    #[prost(int32, optional, tag = "3")]
    channel: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
struct CheckinPayload {
    #[prost(int64, optional, tag = "2")]
    last_checkin_msec: Option<i64>,
    #[prost(message, optional, tag = "13")]
    chrome_build: Option<ChromeBuild>,
    #[prost(int32, optional, tag = "14")]
    device_type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
struct CheckinRequest {
    #[prost(int64, optional, tag = "2")]
    id: Option<i64>,
    #[prost(message, optional, tag = "4")]
    checkin: Option<CheckinPayload>,
    #[prost(fixed64, optional, tag = "13")]
    security_token: Option<u64>,
    #[prost(int32, optional, tag = "14")]
    version: Option<i32>,
    #[prost(int32, optional, tag = "22")]
    user_serial_number: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
struct CheckinResponse {
    #[prost(bool, optional, tag = "1")]
    stats_ok: Option<bool>,
    #[prost(int64, optional, tag = "3")]
    time_msec: Option<i64>,
    #[prost(string, optional, tag = "4")]
    digest: Option<String>,
    #[prost(fixed64, optional, tag = "7")]
    android_id: Option<u64>,
    #[prost(fixed64, optional, tag = "8")]
    security_token: Option<u64>,
    #[prost(string, optional, tag = "11")]
    version_info: Option<String>,
}

// Declared platform triple: a stable Chrome on Mac, device type 3
// (Chrome browser).
const DEVICE_TYPE_CHROME_BROWSER: i32 = 3;
const PLATFORM_MAC: i32 = 2;
const CHANNEL_STABLE: i32 = 1;

/// A device identity issued (or re-confirmed) by check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckinAnswer {
    pub android_id: u64,
    pub security_token: u64,
}

/// Perform a check-in. `None` inputs request a fresh identity; `Some`
/// re-authenticates an existing one.
pub async fn check_in(
    http: &reqwest::Client,
    android_id: Option<u64>,
    security_token: Option<u64>,
) -> Result<CheckinAnswer> {
    let request = CheckinRequest {
        id: android_id.map(|id| id as i64),
        checkin: Some(CheckinPayload {
            last_checkin_msec: None,
            chrome_build: Some(ChromeBuild {
                platform: Some(PLATFORM_MAC),
                chrome_version: Some(CHROME_VERSION.to_string()),
                channel: Some(CHANNEL_STABLE),
            }),
            device_type: Some(DEVICE_TYPE_CHROME_BROWSER),
        }),
        security_token,
        version: Some(3),
        user_serial_number: Some(0),
    };

    let response = http
        .post(CHECKIN_URL)
        .header("Content-Type", "application/x-protobuf")
        .body(request.encode_to_vec())
        .send()
        .await
        .context("check-in request failed")?;

    if !response.status().is_success() {
        bail!("check-in returned HTTP {}", response.status());
    }

    let body = response
        .bytes()
        .await
        .context("failed to read check-in response")?;
    let decoded =
        CheckinResponse::decode(body.as_ref()).context("failed to decode check-in response")?;

    match (decoded.android_id, decoded.security_token) {
        (Some(android_id), Some(security_token)) => Ok(CheckinAnswer {
            android_id,
            security_token,
        }),
        _ => bail!("check-in response is missing the device identity"),
    }
}

/// Register with the default (browser-style) flow and produce a full
/// credentials blob.
pub async fn register(http: &reqwest::Client, sender_id: &str) -> Result<Credentials> {
    let identity = check_in(http, None, None).await.context("check-in failed")?;
    let android_id = identity.android_id.to_string();
    let security_token = identity.security_token.to_string();

    let app_id = format!("wp:receiver.push.com#{}", uuid::Uuid::new_v4());
    let form = [
        ("app", "org.chromium.linux".to_string()),
        ("X-subtype", app_id),
        ("device", android_id.clone()),
        ("sender", sender_id.to_string()),
    ];

    let token = post_register(http, &android_id, &security_token, &form)
        .await
        .context("registration failed")?;

    Ok(Credentials {
        gcm: GcmCredentials {
            android_id,
            security_token,
        },
        fcm: FcmCredentials {
            token,
            keys: generate_keys()?,
        },
    })
}

/// Parameters of the Android-style registration path.
#[derive(Debug, Clone)]
pub struct AndroidRegisterOptions {
    pub api_key: String,
    pub project_id: String,
    pub sender_id: String,
    pub app_id: String,
    pub package_name: String,
    pub package_cert: String,
}

/// Register with the Android-style flow: Firebase installation, check-in,
/// then the registration form with the installation auth token.
pub async fn register_android(
    http: &reqwest::Client,
    opts: &AndroidRegisterOptions,
) -> Result<Credentials> {
    let installation_token = create_installation(http, opts)
        .await
        .context("firebase installation failed")?;

    let identity = check_in(http, None, None).await.context("check-in failed")?;
    let android_id = identity.android_id.to_string();
    let security_token = identity.security_token.to_string();

    let firebase_client = "android-min-sdk/23 fire-core/20.0.0 device-name/a21snnxx \
         device-brand/samsung device-model/a21s android-installer/com.android.vending \
         fire-android/30 fire-installations/17.0.0 fire-fcm/22.0.0 android-platform/ \
         kotlin/1.9.23 android-target-sdk/34";
    let form = [
        ("device", android_id.clone()),
        ("app", opts.package_name.clone()),
        ("cert", opts.package_cert.clone()),
        ("app_ver", "1".to_string()),
        ("X-subtype", opts.sender_id.clone()),
        ("X-app_ver", "1".to_string()),
        ("X-osv", "29".to_string()),
        ("X-cliv", "fiid-21.1.1".to_string()),
        ("X-gmsv", "220217001".to_string()),
        ("X-scope", "*".to_string()),
        ("X-Goog-Firebase-Installations-Auth", installation_token),
        ("X-gms_app_id", opts.app_id.clone()),
        ("X-Firebase-Client", firebase_client.to_string()),
        ("X-Firebase-Client-Log-Type", "1".to_string()),
        ("X-app_ver_name", "1".to_string()),
        ("target_ver", "31".to_string()),
        ("sender", opts.sender_id.clone()),
    ];

    let token = post_register(http, &android_id, &security_token, &form)
        .await
        .context("registration failed")?;

    Ok(Credentials {
        gcm: GcmCredentials {
            android_id,
            security_token,
        },
        fcm: FcmCredentials {
            token,
            keys: generate_keys()?,
        },
    })
}

/// POST the registration form, retrying while the relay answers `Error`.
async fn post_register(
    http: &reqwest::Client,
    android_id: &str,
    security_token: &str,
    form: &[(&str, String)],
) -> Result<String> {
    for attempt in 0..REGISTER_MAX_RETRIES {
        let response = http
            .post(REGISTER_URL)
            .header("Authorization", format!("AidLogin {android_id}:{security_token}"))
            .form(form)
            .send()
            .await
            .context("registration request failed")?;
        let body = response
            .text()
            .await
            .context("failed to read registration response")?;

        if body.contains("Error") {
            log::warn!(
                "registration attempt {}/{} rejected: {}",
                attempt + 1,
                REGISTER_MAX_RETRIES,
                body.trim()
            );
            tokio::time::sleep(REGISTER_RETRY_DELAY).await;
            continue;
        }

        return parse_register_response(&body);
    }
    bail!("registration failed after {REGISTER_MAX_RETRIES} retries")
}

fn parse_register_response(body: &str) -> Result<String> {
    match body.trim().split_once('=') {
        Some((_, token)) if !token.is_empty() => Ok(token.to_string()),
        _ => bail!("unexpected registration response: {body}"),
    }
}

#[derive(Debug, Deserialize)]
struct InstallationAuthToken {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallationResponse {
    auth_token: InstallationAuthToken,
}

/// Create a Firebase installation and return its short-lived auth token.
async fn create_installation(
    http: &reqwest::Client,
    opts: &AndroidRegisterOptions,
) -> Result<String> {
    let fid = generate_fid();
    let body = serde_json::json!({
        "fid": fid,
        "appId": opts.app_id,
        "authVersion": "FIS_v2",
        "sdkVersion": "a:17.0.0",
    });

    let response = http
        .post(crate::constants::installations_url(&opts.project_id))
        .header("Accept", "application/json")
        .header("X-Android-Package", &opts.package_name)
        .header("X-Android-Cert", &opts.package_cert)
        .header("x-goog-api-key", &opts.api_key)
        .json(&body)
        .send()
        .await
        .context("installation request failed")?;

    if !response.status().is_success() {
        bail!("installation returned HTTP {}", response.status());
    }

    let decoded: InstallationResponse = response
        .json()
        .await
        .context("failed to parse installation response")?;
    if decoded.auth_token.token.is_empty() {
        bail!("installation response carried no auth token");
    }
    Ok(decoded.auth_token.token)
}

/// A Firebase installation id: 17 random bytes with the constant 0b0111
/// header nibble, base64 without padding.
fn generate_fid() -> String {
    let mut buf = [0u8; 17];
    OsRng.fill_bytes(&mut buf);
    buf[0] = 0b0111_0000 | (buf[0] & 0b0000_1111);
    BASE64.encode(buf).trim_end_matches('=').to_string()
}

/// Generate the WebPush key material stored in the credentials blob.
fn generate_keys() -> Result<FcmKeys> {
    let secret = SecretKey::random(&mut OsRng);
    let private = BASE64.encode(
        secret
            .to_pkcs8_der()
            .context("failed to encode private key")?
            .as_bytes(),
    );
    let public = BASE64.encode(secret.public_key().to_encoded_point(false).as_bytes());

    let mut auth = [0u8; 16];
    OsRng.fill_bytes(&mut auth);

    Ok(FcmKeys {
        private,
        public,
        auth: BASE64.encode(auth),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpoTokenData {
    expo_push_token: String,
}

#[derive(Debug, Deserialize)]
struct ExpoTokenResponse {
    data: ExpoTokenData,
}

/// Exchange a registration token for an Expo push token.
pub async fn expo_push_token(
    http: &reqwest::Client,
    app_id: &str,
    project_id: &str,
    fcm_token: &str,
) -> Result<String> {
    let body = serde_json::json!({
        "type": "fcm",
        "deviceId": uuid::Uuid::new_v4().to_string(),
        "development": false,
        "appId": app_id,
        "deviceToken": fcm_token,
        "projectId": project_id,
    });

    let response = http
        .post(EXPO_PUSH_TOKEN_URL)
        .json(&body)
        .send()
        .await
        .context("expo token request failed")?;
    if !response.status().is_success() {
        bail!("expo token endpoint returned HTTP {}", response.status());
    }

    let decoded: ExpoTokenResponse = response
        .json()
        .await
        .context("failed to parse expo token response")?;
    Ok(decoded.data.expo_push_token)
}

/// Register the push token with the companion API so the game server can
/// address pairing notifications to this device.
pub async fn register_companion(
    http: &reqwest::Client,
    auth_token: &str,
    push_token: &str,
) -> Result<()> {
    let body = serde_json::json!({
        "AuthToken": auth_token,
        "DeviceId": "gamelink",
        "PushKind": 3,
        "PushToken": push_token,
    });

    let response = http
        .post(COMPANION_REGISTER_URL)
        .json(&body)
        .send()
        .await
        .context("companion registration request failed")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("companion registration failed with HTTP {status}: {body}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;

    #[test]
    fn test_fid_header_nibble() {
        for _ in 0..32 {
            let fid = generate_fid();
            assert!(!fid.ends_with('='));
            // Re-pad for decoding.
            let mut padded = fid.clone();
            while padded.len() % 4 != 0 {
                padded.push('=');
            }
            let decoded = BASE64.decode(&padded).unwrap();
            assert_eq!(decoded.len(), 17);
            assert_eq!(decoded[0] >> 4, 0b0111);
        }
    }

    #[test]
    fn test_generated_keys_shapes() {
        let keys = generate_keys().unwrap();
        let public = BASE64.decode(&keys.public).unwrap();
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04);
        assert_eq!(BASE64.decode(&keys.auth).unwrap().len(), 16);
        // PKCS#8 DER starts with a SEQUENCE.
        assert_eq!(BASE64.decode(&keys.private).unwrap()[0], 0x30);
    }

    #[test]
    fn test_register_response_parsing() {
        assert_eq!(
            parse_register_response("token=abc:DEF-ghi\n").unwrap(),
            "abc:DEF-ghi"
        );
        assert!(parse_register_response("nonsense").is_err());
        assert!(parse_register_response("token=").is_err());
    }

    #[test]
    fn test_checkin_request_round_trip() {
        let request = CheckinRequest {
            id: Some(42),
            checkin: Some(CheckinPayload {
                last_checkin_msec: None,
                chrome_build: Some(ChromeBuild {
                    platform: Some(PLATFORM_MAC),
                    chrome_version: Some(CHROME_VERSION.to_string()),
                    channel: Some(CHANNEL_STABLE),
                }),
                device_type: Some(DEVICE_TYPE_CHROME_BROWSER),
            }),
            security_token: Some(7),
            version: Some(3),
            user_serial_number: Some(0),
        };
        let decoded = CheckinRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, request);
    }
}
