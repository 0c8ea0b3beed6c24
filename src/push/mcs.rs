//! MCS record types and frame serialization.
//!
//! A connection starts with one version byte, then carries a sequence of
//! records:
//!
//! ```text
//! [u8 tag] [varint length] [payload: length bytes]
//! ```
//!
//! The length varint is the standard 7-bits-per-byte little-endian
//! continuation encoding, at most 5 bytes for a 32-bit length. Payloads
//! are protobuf-encoded records; the tag selects the record type.

use prost::Message;

use crate::constants::MCS_VERSION;

/// Record tags fixed by the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum McsTag {
    HeartbeatPing = 0,
    HeartbeatAck = 1,
    LoginRequest = 2,
    LoginResponse = 3,
    Close = 4,
    IqStanza = 7,
    DataMessage = 8,
    StreamError = 10,
}

impl McsTag {
    /// Map a wire tag byte to a known record type.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::HeartbeatPing),
            1 => Some(Self::HeartbeatAck),
            2 => Some(Self::LoginRequest),
            3 => Some(Self::LoginResponse),
            4 => Some(Self::Close),
            7 => Some(Self::IqStanza),
            8 => Some(Self::DataMessage),
            10 => Some(Self::StreamError),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Setting {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum AuthService {
    None = 0,
    AndroidId = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatPing {
    #[prost(int32, optional, tag = "1")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub last_stream_id_received: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub status: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatAck {
    #[prost(int32, optional, tag = "1")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub last_stream_id_received: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub status: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeartbeatConfig {
    #[prost(bool, optional, tag = "1")]
    pub upload_stat: Option<bool>,
    #[prost(string, optional, tag = "2")]
    pub ip: Option<String>,
    #[prost(int32, optional, tag = "3")]
    pub interval_ms: Option<i32>,
}

/// Sent by the client immediately after the version byte.
#[derive(Clone, PartialEq, Message)]
pub struct LoginRequest {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub domain: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub user: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub resource: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub auth_token: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub device_id: Option<String>,
    #[prost(int64, optional, tag = "7")]
    pub last_rmq_id: Option<i64>,
    #[prost(message, repeated, tag = "8")]
    pub setting: Vec<Setting>,
    /// Persistent ids replayed to acknowledge prior delivery.
    #[prost(string, repeated, tag = "10")]
    pub received_persistent_id: Vec<String>,
    #[prost(bool, optional, tag = "12")]
    pub adaptive_heartbeat: Option<bool>,
    #[prost(bool, optional, tag = "14")]
    pub use_rmq2: Option<bool>,
    #[prost(int64, optional, tag = "15")]
    pub account_id: Option<i64>,
    #[prost(enumeration = "AuthService", optional, tag = "16")]
    pub auth_service: Option<i32>,
    #[prost(int32, optional, tag = "17")]
    pub network_type: Option<i32>,
    #[prost(int64, optional, tag = "18")]
    pub status: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorInfo {
    #[prost(int32, optional, tag = "1")]
    pub code: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub kind: Option<String>,
}

/// Completes the login handshake; the replayed persistent ids are
/// implicitly acknowledged once this arrives.
#[derive(Clone, PartialEq, Message)]
pub struct LoginResponse {
    #[prost(string, optional, tag = "1")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub jid: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<ErrorInfo>,
    #[prost(message, repeated, tag = "4")]
    pub setting: Vec<Setting>,
    #[prost(int32, optional, tag = "5")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "6")]
    pub last_stream_id_received: Option<i32>,
    #[prost(message, optional, tag = "7")]
    pub heartbeat_config: Option<HeartbeatConfig>,
    #[prost(int64, optional, tag = "8")]
    pub server_timestamp: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Close {}

#[derive(Clone, PartialEq, Message)]
pub struct IqStanza {
    #[prost(int64, optional, tag = "1")]
    pub rmq_id: Option<i64>,
    #[prost(int32, optional, tag = "2")]
    pub kind: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub from: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub to: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub persistent_id: Option<String>,
    #[prost(int32, optional, tag = "9")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "10")]
    pub last_stream_id_received: Option<i32>,
    #[prost(int64, optional, tag = "12")]
    pub status: Option<i64>,
}

/// A key/value attached to a data record. The WebPush `crypto-key` and
/// `encryption` headers travel here.
#[derive(Clone, PartialEq, Message)]
pub struct AppData {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

/// A push record addressed to a registered application.
#[derive(Clone, PartialEq, Message)]
pub struct DataMessageStanza {
    #[prost(string, optional, tag = "2")]
    pub id: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub from: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub to: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub category: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub token: Option<String>,
    #[prost(message, repeated, tag = "7")]
    pub app_data: Vec<AppData>,
    #[prost(bool, optional, tag = "8")]
    pub from_trusted_server: Option<bool>,
    #[prost(string, optional, tag = "9")]
    pub persistent_id: Option<String>,
    #[prost(int32, optional, tag = "10")]
    pub stream_id: Option<i32>,
    #[prost(int32, optional, tag = "11")]
    pub last_stream_id_received: Option<i32>,
    #[prost(string, optional, tag = "13")]
    pub reg_id: Option<String>,
    #[prost(int64, optional, tag = "16")]
    pub device_user_id: Option<i64>,
    #[prost(int32, optional, tag = "17")]
    pub ttl: Option<i32>,
    #[prost(int64, optional, tag = "18")]
    pub sent: Option<i64>,
    #[prost(int32, optional, tag = "19")]
    pub queued: Option<i32>,
    #[prost(int64, optional, tag = "21")]
    pub status: Option<i64>,
    #[prost(bytes = "vec", optional, tag = "24")]
    pub raw_data: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "34")]
    pub immediate_ack: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StreamErrorStanza {
    #[prost(string, optional, tag = "1")]
    pub kind: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
}

/// A decoded MCS record paired with its tag.
#[derive(Debug, Clone, PartialEq)]
pub enum McsMessage {
    HeartbeatPing(HeartbeatPing),
    HeartbeatAck(HeartbeatAck),
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    Close(Close),
    IqStanza(IqStanza),
    DataMessage(DataMessageStanza),
    StreamError(StreamErrorStanza),
}

impl McsMessage {
    pub fn tag(&self) -> McsTag {
        match self {
            Self::HeartbeatPing(_) => McsTag::HeartbeatPing,
            Self::HeartbeatAck(_) => McsTag::HeartbeatAck,
            Self::LoginRequest(_) => McsTag::LoginRequest,
            Self::LoginResponse(_) => McsTag::LoginResponse,
            Self::Close(_) => McsTag::Close,
            Self::IqStanza(_) => McsTag::IqStanza,
            Self::DataMessage(_) => McsTag::DataMessage,
            Self::StreamError(_) => McsTag::StreamError,
        }
    }

    /// Decode a payload of a known tag. A zero-length payload yields the
    /// default record for that tag.
    pub fn decode(tag: McsTag, payload: &[u8]) -> Result<Self, prost::DecodeError> {
        Ok(match tag {
            McsTag::HeartbeatPing => Self::HeartbeatPing(HeartbeatPing::decode(payload)?),
            McsTag::HeartbeatAck => Self::HeartbeatAck(HeartbeatAck::decode(payload)?),
            McsTag::LoginRequest => Self::LoginRequest(LoginRequest::decode(payload)?),
            McsTag::LoginResponse => Self::LoginResponse(LoginResponse::decode(payload)?),
            McsTag::Close => Self::Close(Close::decode(payload)?),
            McsTag::IqStanza => Self::IqStanza(IqStanza::decode(payload)?),
            McsTag::DataMessage => Self::DataMessage(DataMessageStanza::decode(payload)?),
            McsTag::StreamError => Self::StreamError(StreamErrorStanza::decode(payload)?),
        })
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::HeartbeatPing(m) => m.encode_to_vec(),
            Self::HeartbeatAck(m) => m.encode_to_vec(),
            Self::LoginRequest(m) => m.encode_to_vec(),
            Self::LoginResponse(m) => m.encode_to_vec(),
            Self::Close(m) => m.encode_to_vec(),
            Self::IqStanza(m) => m.encode_to_vec(),
            Self::DataMessage(m) => m.encode_to_vec(),
            Self::StreamError(m) => m.encode_to_vec(),
        }
    }

    /// Serialize as a wire frame. `with_version` prefixes the version byte,
    /// which only the first frame of a connection carries.
    pub fn encode_frame(&self, with_version: bool) -> Vec<u8> {
        let payload = self.payload();
        let mut out = Vec::with_capacity(2 + 5 + payload.len());
        if with_version {
            out.push(MCS_VERSION);
        }
        out.push(self.tag() as u8);
        put_varint(payload.len() as u32, &mut out);
        out.extend_from_slice(&payload);
        out
    }
}

/// Append a 32-bit varint in the 7-bits-per-byte continuation encoding.
pub(crate) fn put_varint(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Outcome of scanning a buffer for a length varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Varint {
    /// A terminated varint of `consumed` bytes.
    Complete { value: u32, consumed: usize },
    /// No terminator yet; more bytes are needed.
    Incomplete,
    /// The varint cannot fit a 32-bit length.
    Overflow,
}

/// Scan the front of `buf` for a length varint, at most 5 bytes.
pub(crate) fn read_varint(buf: &[u8]) -> Varint {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(5).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if value > u64::from(u32::MAX) {
                return Varint::Overflow;
            }
            return Varint::Complete {
                value: value as u32,
                consumed: i + 1,
            };
        }
    }
    if buf.len() >= 5 {
        Varint::Overflow
    } else {
        Varint::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: u32) -> (u32, usize) {
        let mut buf = Vec::new();
        put_varint(value, &mut buf);
        match read_varint(&buf) {
            Varint::Complete { value, consumed } => (value, consumed),
            other => panic!("varint {value} did not round-trip: {other:?}"),
        }
    }

    #[test]
    fn test_varint_round_trip_boundaries() {
        assert_eq!(round_trip(0), (0, 1));
        assert_eq!(round_trip(1), (1, 1));
        assert_eq!(round_trip(127), (127, 1));
        assert_eq!(round_trip(128), (128, 2));
        assert_eq!(round_trip(16383), (16383, 2));
        assert_eq!(round_trip(16384), (16384, 3));
        assert_eq!(round_trip(u32::MAX), (u32::MAX, 5));
    }

    #[test]
    fn test_varint_incomplete() {
        assert_eq!(read_varint(&[0x80]), Varint::Incomplete);
        assert_eq!(read_varint(&[0x80, 0x80, 0x80]), Varint::Incomplete);
        assert_eq!(read_varint(&[]), Varint::Incomplete);
    }

    #[test]
    fn test_varint_six_bytes_overflows() {
        // Five continuation bytes mean the value needs a sixth byte, which
        // a 32-bit length never does.
        assert_eq!(read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]), Varint::Overflow);
    }

    #[test]
    fn test_varint_over_u32_overflows() {
        // 5-byte varint whose top byte pushes past 32 bits.
        assert_eq!(read_varint(&[0xff, 0xff, 0xff, 0xff, 0x7f]), Varint::Overflow);
    }

    #[test]
    fn test_tag_mapping() {
        for tag in [0u8, 1, 2, 3, 4, 7, 8, 10] {
            let mapped = McsTag::from_u8(tag).unwrap();
            assert_eq!(mapped as u8, tag);
        }
        assert_eq!(McsTag::from_u8(5), None);
        assert_eq!(McsTag::from_u8(99), None);
    }

    #[test]
    fn test_frame_layout() {
        let msg = McsMessage::LoginResponse(LoginResponse {
            id: Some("1".to_string()),
            ..Default::default()
        });
        let framed = msg.encode_frame(true);
        assert_eq!(framed[0], MCS_VERSION);
        assert_eq!(framed[1], McsTag::LoginResponse as u8);

        let unversioned = msg.encode_frame(false);
        assert_eq!(unversioned[0], McsTag::LoginResponse as u8);
        assert_eq!(&framed[1..], &unversioned[..]);
    }

    #[test]
    fn test_zero_length_frame() {
        let msg = McsMessage::HeartbeatPing(HeartbeatPing::default());
        let framed = msg.encode_frame(false);
        assert_eq!(framed, vec![McsTag::HeartbeatPing as u8, 0]);
    }
}
