//! Group call session core for a federated messaging client.
//!
//! This crate owns the hard part of multi-party calling on top of a room
//! service: the authoritative local view of who is in a group call, the
//! full-mesh signaling toward every other participant, local and remote
//! stream bookkeeping, active-speaker detection and the sender-key ladder
//! that keeps SFU-relayed media end-to-end encrypted.
//!
//! # Architecture
//!
//! - [`types::ids::VoipId`] & [`types::ids::Participant`]: identity of a
//!   room+call pair and of a (user, device) member
//! - [`member_view::MembershipView`]: soft-state membership with expiry,
//!   projected from per-user room state events
//! - [`streams::StreamRegistry`]: local and remote user-media and
//!   screenshare streams
//! - [`peers::PeerCallTable`]: one peer call per remote participant, with
//!   add/replace/remove semantics
//! - [`session::GroupCallSession`]: the state machine tying it together,
//!   plus the membership heartbeat and the E2EE key ladder
//! - [`registry::CallRegistry`]: the owning map of live sessions
//! - [`services`]: capability traits for everything external (room state,
//!   device messaging, media devices, key installation, peer transports)
//!
//! The WebRTC stack, the SFU protocol and the room transport itself live
//! outside this crate; sessions only hold capability handles to them.

pub mod config;
pub mod e2ee;
pub mod error;
pub mod member_view;
pub mod peers;
pub mod registry;
pub mod services;
pub mod session;
pub mod speaker;
pub mod streams;
pub mod types;


pub use config::CallConfig;
pub use error::{GroupCallError, ServiceError};
pub use member_view::MembershipView;
pub use registry::CallRegistry;
pub use services::{
    CallDirection, DeviceMessenger, HangupReason, IceServer, KeyProvider, MediaDevices,
    MediaStream, MediaTransport, MemberStateEvent, PeerCallEvents, PeerCallFactory,
    PeerCallOptions, PeerCallState, PeerCallType, RoomService, StatsReport,
};
pub use session::{GroupCallSession, GroupCallState, SessionContext};
pub use streams::{StreamPurpose, WrappedMediaStream};
pub use types::events::{CallEventBus, GroupCallEvent};
pub use types::ids::{Participant, VoipId};
pub use types::member::{CallBackend, CallMembership};
