//! Identity types for group calls and their participants.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a group call session: the room it lives in plus the
/// call id within that room.
///
/// The string form is `"{room_id}:{call_id}"`. Room ids may contain colons
/// (`!room:server.example`), call ids never do, so parsing splits on the
/// *last* colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoipId {
    pub room_id: String,
    pub call_id: String,
}

impl VoipId {
    pub fn new(room_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for VoipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_id, self.call_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoipIdParseError(pub String);

impl fmt::Display for VoipIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid voip id (no colon): {}", self.0)
    }
}

impl std::error::Error for VoipIdParseError {}

impl FromStr for VoipId {
    type Err = VoipIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (room_id, call_id) = s
            .rsplit_once(':')
            .ok_or_else(|| VoipIdParseError(s.to_string()))?;
        Ok(Self::new(room_id, call_id))
    }
}

/// A (user, device) pair taking part in a group call.
///
/// The canonical id concatenates the user id and the device id (empty when
/// absent). It is the ordering key everywhere a deterministic order between
/// participants is needed, most importantly the call-initiation tie-break:
/// of two participants, only the one with the smaller canonical id places
/// the outgoing call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub device_id: Option<String>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }

    pub fn canonical_id(&self) -> String {
        format!("{}{}", self.user_id, self.device_id.as_deref().unwrap_or(""))
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_id())
    }
}

impl Ord for Participant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical_id().cmp(&other.canonical_id())
    }
}

impl PartialOrd for Participant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
