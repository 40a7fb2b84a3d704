//! Error types for the group call core.

use thiserror::Error;

use crate::session::GroupCallState;

/// Error raised by an external collaborator (room service, device
/// messenger, media devices, peer call factory or transport).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum GroupCallError {
    /// The operation is not allowed in the session's current state. The
    /// session is left untouched.
    #[error("{operation} not allowed while {state:?}")]
    WrongState {
        operation: &'static str,
        state: GroupCallState,
    },

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(ServiceError),

    #[error("screenshare failed: {0}")]
    Screenshare(ServiceError),

    #[error("peer call not found: {0}")]
    PeerCallMissing(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("key delivery to {user_id}:{device_id} failed after {attempts} attempts: {reason}")]
    KeyDelivery {
        user_id: String,
        device_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("key ratchet returned empty bytes after {0} attempts")]
    RatchetFailed(u32),

    #[error("stale call session: {0}")]
    StaleSession(String),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}
