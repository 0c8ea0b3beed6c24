//! Persisted registration credentials.
//!
//! A single JSON blob written with mode 0600:
//!
//! ```json
//! {
//!   "gcm": { "androidId": "…", "securityToken": "…" },
//!   "fcm": {
//!     "token": "…",
//!     "keys": { "private": "…", "public": "…", "auth": "…" }
//!   }
//! }
//! ```
//!
//! `keys.private` is the base64 of a PKCS#8-encoded P-256 private key,
//! `keys.public` the base64 of the SEC1-uncompressed public point, and
//! `keys.auth` the base64 of the 16-byte WebPush authentication secret.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Device identity issued by check-in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcmCredentials {
    /// Decimal-string 64-bit device identifier.
    pub android_id: String,
    /// Decimal-string 64-bit token bound to the identifier.
    pub security_token: String,
}

/// Key material used for WebPush record decryption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcmKeys {
    /// Base64 PKCS#8 P-256 private key.
    pub private: String,
    /// Base64 SEC1-uncompressed public point.
    pub public: String,
    /// Base64 16-byte authentication secret.
    pub auth: String,
}

/// Per-app registration token plus decryption keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FcmCredentials {
    /// Opaque registration token (server-side routing key).
    pub token: String,
    pub keys: FcmKeys,
}

/// The full credentials blob produced by registration and consumed by the
/// push session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub gcm: GcmCredentials,
    pub fcm: FcmCredentials,
}

impl Credentials {
    /// Load credentials from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("invalid credentials file {}", path.display()))
    }

    /// Write credentials as pretty JSON with mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)
            .with_context(|| format!("failed to write credentials file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }
}

/// Read a persistent-ids file: a JSON array of strings.
pub fn load_persistent_ids(path: &Path) -> Result<Vec<String>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read persistent-ids file {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("invalid persistent-ids file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credentials {
        Credentials {
            gcm: GcmCredentials {
                android_id: "5153094744723899683".to_string(),
                security_token: "7392735078556411239".to_string(),
            },
            fcm: FcmCredentials {
                token: "cSXCTCTMTY0:APA91bHq".to_string(),
                keys: FcmKeys {
                    private: "MIGHAgEAMBMGByqGSM49".to_string(),
                    public: "BDRxWapKRSTHW0PfXBZc".to_string(),
                    auth: "sxYDWWsNVkDXajVYRBRheg==".to_string(),
                },
            },
        }
    }

    #[test]
    fn test_json_round_trip_is_lossless() {
        let creds = sample();
        let json = serde_json::to_string(&creds).unwrap();
        let loaded: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, creds);
    }

    #[test]
    fn test_field_names_match_wire_format() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json["gcm"]["androidId"].is_string());
        assert!(json["gcm"]["securityToken"].is_string());
        assert!(json["fcm"]["token"].is_string());
        assert!(json["fcm"]["keys"]["private"].is_string());
        assert!(json["fcm"]["keys"]["public"].is_string());
        assert!(json["fcm"]["keys"]["auth"].is_string());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let creds = sample();
        creds.save(&path).unwrap();
        let loaded = Credentials::load(&path).unwrap();
        assert_eq!(loaded, creds);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        sample().save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_persistent_ids_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.json");
        fs::write(&path, r#"["p1","p2","p3"]"#).unwrap();

        let ids = load_persistent_ids(&path).unwrap();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Credentials::load(Path::new("/nonexistent/credentials.json")).is_err());
    }
}
