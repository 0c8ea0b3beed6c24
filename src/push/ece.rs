//! WebPush Encrypted-Content-Encoding, "aesgcm" variant.
//!
//! Implements the record scheme of draft-ietf-webpush-encryption-03:
//! an ECDH P-256 agreement mixed through two HKDF-SHA256 stages into an
//! AES-128-GCM content key and nonce base, with a 2-byte big-endian
//! padding prefix inside each record.
//!
//! Key derivation:
//!
//! ```text
//! ikm   = HKDF(salt=authSecret, ikm=ECDH(private, peer),
//!              info="Content-Encoding: auth\0", L=32)
//! key   = HKDF(salt, ikm)-Expand("Content-Encoding: aesgcm\0" | context, 16)
//! nonce = HKDF(salt, ikm)-Expand("Content-Encoding: nonce\0"  | context, 12)
//! ```
//!
//! where `context = "P-256\0" | len | recipientPub | len | senderPub`.
//! Record `i` uses the nonce base XORed with the big-endian counter in
//! its low six bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64URL};
use base64::Engine;
use hkdf::Hkdf;
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::{PublicKey, SecretKey};
use sha2::Sha256;

use crate::constants::DEFAULT_RECORD_SIZE;

const TAG_LENGTH: usize = 16;
const KEY_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;
const PAD_SIZE: usize = 2;

const AUTH_INFO: &[u8] = b"Content-Encoding: auth\0";
const KEY_INFO: &[u8] = b"Content-Encoding: aesgcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";
const CURVE_LABEL: &[u8] = b"P-256\0";

/// An encrypted push record as carried by a data-message stanza.
#[derive(Debug, Clone, Default)]
pub struct EncryptedMessage {
    /// The `crypto-key` header value (`dh=<base64url point>`).
    pub crypto_key: Option<String>,
    /// The `encryption` header value (`salt=<base64url 16 bytes>`).
    pub encryption: Option<String>,
    /// Concatenated ciphertext records.
    pub raw_data: Vec<u8>,
}

/// Stored key material for decryption.
#[derive(Debug, Clone)]
pub struct Keys {
    /// Base64 PKCS#8 P-256 private key.
    pub private_key: String,
    /// Base64 16-byte authentication secret.
    pub auth_secret: String,
}

/// Decryption failures, split into the ignorable kind (drop the record,
/// still dedupe it) and everything else (surfaced to the caller).
#[derive(Debug)]
pub enum DecryptError {
    /// No `crypto-key` header on the record.
    MissingCryptoKey,
    /// No `encryption` (salt) header on the record.
    MissingSalt,
    /// AES-GCM rejected a record.
    AuthenticationFailed,
    /// Key material could not be parsed.
    InvalidKey(String),
    /// The record structure itself is damaged.
    Malformed(String),
}

impl DecryptError {
    /// Whether the record should be silently dropped (and still deduped).
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            Self::MissingCryptoKey | Self::MissingSalt | Self::AuthenticationFailed
        )
    }
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCryptoKey => write!(f, "crypto-key is missing"),
            Self::MissingSalt => write!(f, "salt is missing"),
            Self::AuthenticationFailed => write!(f, "unable to authenticate record"),
            Self::InvalidKey(msg) => write!(f, "invalid key material: {msg}"),
            Self::Malformed(msg) => write!(f, "malformed record: {msg}"),
        }
    }
}

impl std::error::Error for DecryptError {}

/// Decrypt a push record and parse the plaintext as JSON.
pub fn decrypt_message(
    message: &EncryptedMessage,
    keys: &Keys,
) -> Result<serde_json::Value, DecryptError> {
    let crypto_key = message
        .crypto_key
        .as_deref()
        .ok_or(DecryptError::MissingCryptoKey)?;
    let encryption = message
        .encryption
        .as_deref()
        .ok_or(DecryptError::MissingSalt)?;

    let dh = header_param(crypto_key, "dh").ok_or(DecryptError::MissingCryptoKey)?;
    let salt = header_param(encryption, "salt").ok_or(DecryptError::MissingSalt)?;

    let dh = decode_b64(dh).map_err(|e| DecryptError::Malformed(format!("dh value: {e}")))?;
    let salt = decode_b64(salt).map_err(|e| DecryptError::Malformed(format!("salt value: {e}")))?;

    let private_der = decode_b64(&keys.private_key)
        .map_err(|e| DecryptError::InvalidKey(format!("private key: {e}")))?;
    let secret = SecretKey::from_pkcs8_der(&private_der)
        .map_err(|e| DecryptError::InvalidKey(format!("private key: {e}")))?;
    let auth_secret = decode_b64(&keys.auth_secret)
        .map_err(|e| DecryptError::InvalidKey(format!("auth secret: {e}")))?;

    let peer = PublicKey::from_sec1_bytes(&dh)
        .map_err(|e| DecryptError::Malformed(format!("peer public point: {e}")))?;
    let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

    let own_pub = secret.public_key().to_encoded_point(false);
    let (key, nonce_base) = derive_key_and_nonce(
        shared.raw_secret_bytes().as_slice(),
        &auth_secret,
        &salt,
        own_pub.as_bytes(),
        &dh,
    );

    let plaintext = decrypt_records(&message.raw_data, &key, &nonce_base, DEFAULT_RECORD_SIZE)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| DecryptError::Malformed(format!("plaintext is not JSON: {e}")))
}

/// Decrypt a run of `rs + 16`-byte records and strip the legacy padding.
pub fn decrypt_records(
    buffer: &[u8],
    key: &[u8; KEY_LENGTH],
    nonce_base: &[u8; NONCE_LENGTH],
    rs: usize,
) -> Result<Vec<u8>, DecryptError> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|_| DecryptError::InvalidKey("content key length".to_string()))?;

    let chunk = rs + TAG_LENGTH;
    let mut result = Vec::new();
    let mut start = 0;
    let mut counter: u64 = 0;

    while start < buffer.len() {
        let end = start + chunk;
        // A full-sized final record means the stream was cut: the scheme
        // always terminates with a short record.
        if end == buffer.len() {
            return Err(DecryptError::Malformed("truncated payload".to_string()));
        }
        let end = end.min(buffer.len());
        if end - start <= TAG_LENGTH {
            return Err(DecryptError::Malformed(format!(
                "record {counter} too small"
            )));
        }

        let nonce = record_nonce(nonce_base, counter);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), &buffer[start..end])
            .map_err(|_| DecryptError::AuthenticationFailed)?;
        result.extend_from_slice(&unpad_legacy(&plaintext)?);

        start = end;
        counter += 1;
    }

    Ok(result)
}

/// Encrypt a plaintext into "aesgcm" records. The counterpart of
/// [`decrypt_records`]; the relay side of the scheme, kept crate-private
/// to produce test vectors and round-trip fixtures. The client itself
/// only ever decrypts.
pub(crate) fn encrypt_records(
    plaintext: &[u8],
    key: &[u8; KEY_LENGTH],
    nonce_base: &[u8; NONCE_LENGTH],
    rs: usize,
) -> Result<Vec<u8>, DecryptError> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|_| DecryptError::InvalidKey("content key length".to_string()))?;

    if rs <= PAD_SIZE {
        return Err(DecryptError::Malformed("record size too small".to_string()));
    }
    let capacity = rs - PAD_SIZE;

    let mut out = Vec::new();
    let mut start = 0;
    let mut counter: u64 = 0;

    loop {
        let end = start + capacity;
        // Strictly greater: a plaintext that fills its record exactly is
        // followed by one padding-only record so the final record is short.
        let last = end > plaintext.len();
        let chunk = &plaintext[start..end.min(plaintext.len())];

        let mut record = Vec::with_capacity(PAD_SIZE + chunk.len());
        record.extend_from_slice(&[0, 0]);
        record.extend_from_slice(chunk);

        let nonce = record_nonce(nonce_base, counter);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), record.as_slice())
            .map_err(|_| DecryptError::Malformed("encryption failed".to_string()))?;
        out.extend_from_slice(&sealed);

        if last {
            break;
        }
        start = end;
        counter += 1;
    }

    Ok(out)
}

/// Derive the AES-128-GCM content key and nonce base.
///
/// `recipient_pub` is the uncompressed point of the party holding the
/// private key that will decrypt; `sender_pub` is the ephemeral `dh`
/// point from the other side.
pub fn derive_key_and_nonce(
    shared: &[u8],
    auth_secret: &[u8],
    salt: &[u8],
    recipient_pub: &[u8],
    sender_pub: &[u8],
) -> ([u8; KEY_LENGTH], [u8; NONCE_LENGTH]) {
    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(auth_secret), shared)
        .expand(AUTH_INFO, &mut ikm)
        .expect("32 bytes is a valid hkdf output length");

    let context = key_context(recipient_pub, sender_pub);
    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);

    let mut key = [0u8; KEY_LENGTH];
    let mut key_info = KEY_INFO.to_vec();
    key_info.extend_from_slice(&context);
    hk.expand(&key_info, &mut key)
        .expect("16 bytes is a valid hkdf output length");

    let mut nonce = [0u8; NONCE_LENGTH];
    let mut nonce_info = NONCE_INFO.to_vec();
    nonce_info.extend_from_slice(&context);
    hk.expand(&nonce_info, &mut nonce)
        .expect("12 bytes is a valid hkdf output length");

    (key, nonce)
}

fn key_context(recipient_pub: &[u8], sender_pub: &[u8]) -> Vec<u8> {
    let mut context = Vec::with_capacity(CURVE_LABEL.len() + 4 + recipient_pub.len() + sender_pub.len());
    context.extend_from_slice(CURVE_LABEL);
    context.extend_from_slice(&(recipient_pub.len() as u16).to_be_bytes());
    context.extend_from_slice(recipient_pub);
    context.extend_from_slice(&(sender_pub.len() as u16).to_be_bytes());
    context.extend_from_slice(sender_pub);
    context
}

/// XOR the big-endian record counter into the low six nonce bytes.
fn record_nonce(base: &[u8; NONCE_LENGTH], counter: u64) -> [u8; NONCE_LENGTH] {
    let mut nonce = *base;
    for (i, byte) in nonce.iter_mut().skip(NONCE_LENGTH - 6).enumerate() {
        *byte ^= ((counter >> (8 * (5 - i))) & 0xff) as u8;
    }
    nonce
}

/// Strip the 2-byte big-endian pad-length prefix and its zero bytes.
fn unpad_legacy(data: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if data.len() < PAD_SIZE {
        return Err(DecryptError::Malformed("record shorter than padding header".to_string()));
    }
    let pad = u16::from_be_bytes([data[0], data[1]]) as usize;
    if pad + PAD_SIZE > data.len() {
        return Err(DecryptError::Malformed("padding exceeds record".to_string()));
    }
    if data[PAD_SIZE..PAD_SIZE + pad].iter().any(|&b| b != 0) {
        return Err(DecryptError::Malformed("padding bytes not zero".to_string()));
    }
    Ok(data[PAD_SIZE + pad..].to_vec())
}

/// Extract `name=value` from a header value such as `dh=abc; other=x`.
fn header_param<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}

/// Decode base64 accepting both the url-safe unpadded alphabet used on
/// the wire and the standard padded one used in stored credentials.
fn decode_b64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64URL
        .decode(value)
        .or_else(|_| BASE64.decode(value))
}
