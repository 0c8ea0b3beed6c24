//! Game RPC frame types.
//!
//! Every WebSocket binary message is one serialized frame: outbound
//! frames are an [`AppRequest`] stamped with a sequence number and the
//! player credentials; inbound frames are an [`AppMessage`] holding
//! either a sequenced [`AppResponse`] or a server-initiated
//! [`AppBroadcast`].

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct AppEmpty {}

#[derive(Clone, PartialEq, Message)]
pub struct Vector2 {
    #[prost(float, optional, tag = "1")]
    pub x: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub y: Option<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Vector3 {
    #[prost(float, optional, tag = "1")]
    pub x: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub y: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub z: Option<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppSendMessage {
    #[prost(string, optional, tag = "1")]
    pub message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppSetEntityValue {
    #[prost(bool, optional, tag = "1")]
    pub value: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppCameraSubscribe {
    #[prost(string, optional, tag = "1")]
    pub camera_id: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppCameraInput {
    #[prost(int32, optional, tag = "1")]
    pub buttons: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub mouse_delta: Option<Vector2>,
}

/// An outbound request. Exactly one of the operation fields is set.
#[derive(Clone, PartialEq, Message)]
pub struct AppRequest {
    #[prost(uint32, optional, tag = "1")]
    pub seq: Option<u32>,
    #[prost(uint64, optional, tag = "2")]
    pub player_id: Option<u64>,
    #[prost(int32, optional, tag = "3")]
    pub player_token: Option<i32>,
    #[prost(uint32, optional, tag = "4")]
    pub entity_id: Option<u32>,

    #[prost(message, optional, tag = "8")]
    pub get_info: Option<AppEmpty>,
    #[prost(message, optional, tag = "9")]
    pub get_time: Option<AppEmpty>,
    #[prost(message, optional, tag = "10")]
    pub get_map: Option<AppEmpty>,
    #[prost(message, optional, tag = "11")]
    pub get_team_info: Option<AppEmpty>,
    #[prost(message, optional, tag = "12")]
    pub get_team_chat: Option<AppEmpty>,
    #[prost(message, optional, tag = "13")]
    pub send_team_message: Option<AppSendMessage>,
    #[prost(message, optional, tag = "14")]
    pub get_entity_info: Option<AppEmpty>,
    #[prost(message, optional, tag = "15")]
    pub set_entity_value: Option<AppSetEntityValue>,

    #[prost(message, optional, tag = "30")]
    pub camera_subscribe: Option<AppCameraSubscribe>,
    #[prost(message, optional, tag = "31")]
    pub camera_unsubscribe: Option<AppEmpty>,
    #[prost(message, optional, tag = "32")]
    pub camera_input: Option<AppCameraInput>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppError {
    #[prost(string, optional, tag = "1")]
    pub error: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppFlag {
    #[prost(bool, optional, tag = "1")]
    pub value: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppInfo {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub header_image: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub url: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub map: Option<String>,
    #[prost(uint32, optional, tag = "5")]
    pub map_size: Option<u32>,
    #[prost(uint32, optional, tag = "6")]
    pub wipe_time: Option<u32>,
    #[prost(uint32, optional, tag = "7")]
    pub players: Option<u32>,
    #[prost(uint32, optional, tag = "8")]
    pub max_players: Option<u32>,
    #[prost(uint32, optional, tag = "9")]
    pub queued_players: Option<u32>,
    #[prost(uint32, optional, tag = "10")]
    pub seed: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppTime {
    #[prost(float, optional, tag = "1")]
    pub day_length_minutes: Option<f32>,
    #[prost(float, optional, tag = "2")]
    pub time_scale: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub sunrise: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub sunset: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub time: Option<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppMapMonument {
    #[prost(string, optional, tag = "1")]
    pub token: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub x: Option<f32>,
    #[prost(float, optional, tag = "3")]
    pub y: Option<f32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppMap {
    #[prost(uint32, optional, tag = "1")]
    pub width: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub height: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub jpg_image: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "4")]
    pub ocean_margin: Option<i32>,
    #[prost(message, repeated, tag = "5")]
    pub monuments: Vec<AppMapMonument>,
    #[prost(string, optional, tag = "6")]
    pub background: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppTeamMember {
    #[prost(uint64, optional, tag = "1")]
    pub steam_id: Option<u64>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(float, optional, tag = "3")]
    pub x: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub y: Option<f32>,
    #[prost(bool, optional, tag = "5")]
    pub is_online: Option<bool>,
    #[prost(uint32, optional, tag = "6")]
    pub spawn_time: Option<u32>,
    #[prost(bool, optional, tag = "7")]
    pub is_alive: Option<bool>,
    #[prost(uint32, optional, tag = "8")]
    pub death_time: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppTeamInfo {
    #[prost(uint64, optional, tag = "1")]
    pub leader_steam_id: Option<u64>,
    #[prost(message, repeated, tag = "2")]
    pub members: Vec<AppTeamMember>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppTeamMessage {
    #[prost(uint64, optional, tag = "1")]
    pub steam_id: Option<u64>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub color: Option<String>,
    #[prost(uint32, optional, tag = "5")]
    pub time: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppTeamChat {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<AppTeamMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppEntityPayload {
    #[prost(bool, optional, tag = "1")]
    pub value: Option<bool>,
    #[prost(int32, optional, tag = "3")]
    pub capacity: Option<i32>,
    #[prost(bool, optional, tag = "4")]
    pub has_protection: Option<bool>,
    #[prost(uint32, optional, tag = "5")]
    pub protection_expiry: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum AppEntityKind {
    Unknown = 0,
    Switch = 1,
    Alarm = 2,
    StorageMonitor = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppEntityInfo {
    #[prost(enumeration = "AppEntityKind", optional, tag = "1")]
    pub kind: Option<i32>,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<AppEntityPayload>,
}

/// Camera geometry and permissions returned by a subscribe.
#[derive(Clone, PartialEq, Message)]
pub struct AppCameraInfo {
    #[prost(int32, optional, tag = "1")]
    pub width: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub height: Option<i32>,
    #[prost(float, optional, tag = "3")]
    pub near_plane: Option<f32>,
    #[prost(float, optional, tag = "4")]
    pub far_plane: Option<f32>,
    #[prost(int32, optional, tag = "5")]
    pub control_flags: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum RayEntityKind {
    Unknown = 0,
    Tree = 1,
    Player = 2,
}

/// A 3D entity visible in a ray frame.
#[derive(Clone, PartialEq, Message)]
pub struct RayEntity {
    #[prost(uint32, optional, tag = "1")]
    pub entity_id: Option<u32>,
    #[prost(enumeration = "RayEntityKind", optional, tag = "2")]
    pub kind: Option<i32>,
    #[prost(message, optional, tag = "3")]
    pub position: Option<Vector3>,
    #[prost(message, optional, tag = "4")]
    pub rotation: Option<Vector3>,
    #[prost(message, optional, tag = "5")]
    pub size: Option<Vector3>,
    #[prost(string, optional, tag = "6")]
    pub name: Option<String>,
}

/// A fragment of a rendered camera image: RGBA samples whose pixel
/// positions are recovered from `sample_offset`, plus visible entities.
#[derive(Clone, PartialEq, Message)]
pub struct AppCameraRays {
    #[prost(float, optional, tag = "1")]
    pub vertical_fov: Option<f32>,
    #[prost(uint32, optional, tag = "2")]
    pub sample_offset: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub ray_data: Option<Vec<u8>>,
    #[prost(float, optional, tag = "4")]
    pub distance: Option<f32>,
    #[prost(message, repeated, tag = "5")]
    pub entities: Vec<RayEntity>,
}

/// A sequenced reply to one request.
#[derive(Clone, PartialEq, Message)]
pub struct AppResponse {
    #[prost(uint32, optional, tag = "1")]
    pub seq: Option<u32>,
    #[prost(message, optional, tag = "2")]
    pub success: Option<AppEmpty>,
    #[prost(message, optional, tag = "3")]
    pub error: Option<AppError>,
    #[prost(message, optional, tag = "4")]
    pub info: Option<AppInfo>,
    #[prost(message, optional, tag = "5")]
    pub time: Option<AppTime>,
    #[prost(message, optional, tag = "6")]
    pub map: Option<AppMap>,
    #[prost(message, optional, tag = "7")]
    pub team_info: Option<AppTeamInfo>,
    #[prost(message, optional, tag = "8")]
    pub team_chat: Option<AppTeamChat>,
    #[prost(message, optional, tag = "9")]
    pub entity_info: Option<AppEntityInfo>,
    #[prost(message, optional, tag = "10")]
    pub flag: Option<AppFlag>,
    #[prost(message, optional, tag = "20")]
    pub camera_subscribe_info: Option<AppCameraInfo>,
}

/// A server-initiated frame with no request sequence.
#[derive(Clone, PartialEq, Message)]
pub struct AppBroadcast {
    #[prost(message, optional, tag = "1")]
    pub team_changed: Option<AppTeamInfo>,
    #[prost(message, optional, tag = "2")]
    pub team_message: Option<AppTeamMessage>,
    #[prost(message, optional, tag = "3")]
    pub entity_changed: Option<AppEntityInfo>,
    #[prost(message, optional, tag = "10")]
    pub camera_rays: Option<AppCameraRays>,
}

/// One inbound WebSocket message.
#[derive(Clone, PartialEq, Message)]
pub struct AppMessage {
    #[prost(message, optional, tag = "1")]
    pub response: Option<AppResponse>,
    #[prost(message, optional, tag = "2")]
    pub broadcast: Option<AppBroadcast>,
}
