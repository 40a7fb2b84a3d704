//! External collaborator interfaces.
//!
//! The session core never talks to the network or the media stack directly:
//! the room-state transport, the encrypted device-to-device channel, the
//! media devices, the key installer and the per-peer WebRTC sessions are all
//! capability handles injected at construction. Implementations live in the
//! surrounding client; tests use handwritten mocks.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ServiceError;
use crate::streams::WrappedMediaStream;
use crate::types::ids::Participant;

/// To-device event type distributing sender keys.
pub const ENCRYPTION_KEYS_EVENT_TYPE: &str = "com.famedly.call.encryption_keys";
/// To-device event type requesting a resend of the sender key.
pub const ENCRYPTION_KEYS_REQUEST_EVENT_TYPE: &str = "com.famedly.call.request_encryption_keys";

/// One per-user call member state event as stored in the room.
#[derive(Debug, Clone)]
pub struct MemberStateEvent {
    /// User the state entry belongs to (the state key).
    pub sender: String,
    /// Server-origin timestamp, milliseconds.
    pub origin_server_ts: i64,
    /// Raw event content; holds the `memberships` array.
    pub content: Value,
}

/// Room-state transport: reads and writes the per-user call member events.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// All call member state events currently in the room, one per user.
    async fn call_member_events(&self, room_id: &str)
    -> Result<Vec<MemberStateEvent>, ServiceError>;

    /// Replaces `user_id`'s call member state event content.
    async fn set_call_member_event(
        &self,
        room_id: &str,
        user_id: &str,
        content: Value,
    ) -> Result<(), ServiceError>;
}

/// Encrypted device-to-device channel for VoIP events.
///
/// Implementations pick the encrypted channel when the room is encrypted and
/// own transaction-id generation.
#[async_trait]
pub trait DeviceMessenger: Send + Sync {
    async fn send_to_device(
        &self,
        user_id: &str,
        device_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<(), ServiceError>;
}

/// Installs sender keys into the media encryptor and derives ratchet steps.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn on_set_encryption_key(&self, participant: &Participant, key: &[u8], index: u8);

    /// Deterministically advances the key at `index`. An empty result is
    /// treated as transient by the caller.
    async fn on_ratchet_key(&self, participant: &Participant, index: u8) -> Vec<u8>;
}

/// Handle to an underlying media stream owned by the platform media stack.
pub trait MediaStream: Send + Sync {
    fn id(&self) -> &str;
    fn stop(&self);
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self) -> Result<Arc<dyn MediaStream>, ServiceError>;
    async fn get_display_media(&self) -> Result<Arc<dyn MediaStream>, ServiceError>;
}

/// Lifecycle state of a single peer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCallState {
    Fledgling,
    InviteSent,
    Ringing,
    Connecting,
    Connected,
    Ended,
}

/// Reason a peer call was hung up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupReason {
    UserHangup,
    /// The call was swapped for a replacement; listeners must not treat this
    /// as a terminal hangup of the participant.
    Replaced,
    InviteTimeout,
    IceFailed,
    UnknownError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCallType {
    Voice,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// One entry of a transport statistics report. Only the fields the
/// active-speaker detector reads are modeled.
#[derive(Debug, Clone)]
pub struct StatsReport {
    /// Report type, e.g. `"inbound-rtp"` or `"media-source"`.
    pub report_type: String,
    /// Media kind, `"audio"` or `"video"`.
    pub kind: String,
    pub audio_level: Option<f64>,
}

/// Options for creating an outgoing peer call.
#[derive(Debug, Clone)]
pub struct PeerCallOptions {
    pub call_id: String,
    pub room_id: String,
    pub group_call_id: String,
    pub direction: CallDirection,
    pub call_type: PeerCallType,
    /// Our party id on the signaling wire; the session's membership id.
    pub local_party_id: String,
    pub ice_servers: Vec<IceServer>,
    pub remote_user_id: String,
    pub remote_device_id: Option<String>,
    /// The remote's membership id, used to detect stale peer sessions.
    pub remote_session_id: String,
}

/// Event streams of one peer call, subscribed once when the call is added
/// to the table.
pub struct PeerCallEvents {
    pub state: broadcast::Receiver<PeerCallState>,
    pub hangup: broadcast::Receiver<HangupReason>,
    pub replaced: broadcast::Receiver<Arc<dyn MediaTransport>>,
    pub stream_added: broadcast::Receiver<WrappedMediaStream>,
    pub stream_removed: broadcast::Receiver<WrappedMediaStream>,
    pub feeds_changed: broadcast::Receiver<()>,
}

/// One peer-to-peer media session, owned by the peer call table.
///
/// This is the capability surface the session needs from the WebRTC layer;
/// the actual peer-connection implementation lives outside the crate.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn call_id(&self) -> String;
    fn room_id(&self) -> String;
    fn group_call_id(&self) -> Option<String>;
    fn remote_user_id(&self) -> String;
    fn remote_device_id(&self) -> Option<String>;
    /// The remote's membership id as attached at creation or learned during
    /// signaling.
    fn remote_session_id(&self) -> Option<String>;
    fn state(&self) -> PeerCallState;
    fn events(&self) -> PeerCallEvents;

    async fn place_call_with_streams(
        &self,
        streams: Vec<WrappedMediaStream>,
    ) -> Result<(), ServiceError>;
    async fn answer_with_streams(
        &self,
        streams: Vec<WrappedMediaStream>,
    ) -> Result<(), ServiceError>;
    async fn add_local_stream(&self, stream: WrappedMediaStream) -> Result<(), ServiceError>;
    async fn remove_local_stream(&self, stream: &WrappedMediaStream) -> Result<(), ServiceError>;
    async fn hangup(&self, reason: HangupReason, should_emit: bool) -> Result<(), ServiceError>;
    async fn set_microphone_muted(&self, muted: bool);
    async fn set_local_video_muted(&self, muted: bool);
    async fn update_media_device(&self);
    async fn get_stats(&self) -> Result<Vec<StatsReport>, ServiceError>;
}

impl dyn MediaTransport {
    /// The remote side as a participant.
    pub fn remote_participant(&self) -> Participant {
        Participant::new(self.remote_user_id(), self.remote_device_id())
    }
}

/// Creates outgoing peer calls and surfaces incoming ones.
#[async_trait]
pub trait PeerCallFactory: Send + Sync {
    async fn create_call(
        &self,
        opts: PeerCallOptions,
    ) -> Result<Arc<dyn MediaTransport>, ServiceError>;

    /// Current ICE server set, queried per outgoing call.
    async fn ice_servers(&self) -> Vec<IceServer>;

    /// Stream of incoming calls for any group call in any room.
    fn incoming_calls(&self) -> broadcast::Receiver<Arc<dyn MediaTransport>>;

    /// Incoming calls that arrived before the session entered.
    async fn pending_incoming_calls(&self) -> Vec<Arc<dyn MediaTransport>>;
}
