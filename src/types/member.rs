//! Call membership state: the per-user room state entries asserting who is
//! currently in which group call.
//!
//! Membership is advisory soft state: an entry is live until its
//! `expires_ts` passes, and the holder keeps bumping the expiry while it is
//! in the call. Entries arrive as loosely typed JSON inside the per-user
//! member state event; everything past the validator here operates on the
//! typed [`CallMembership`].

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::Participant;

/// State event type carrying the `memberships` array, one event per user.
pub const CALL_MEMBER_EVENT_TYPE: &str = "com.famedly.call.member";

/// Default application when an entry omits one.
pub const DEFAULT_APPLICATION: &str = "m.call";
/// Default scope when an entry omits one.
pub const DEFAULT_SCOPE: &str = "m.room";

/// Media backend a group call runs on.
///
/// Mesh is full P2P: both signaling and media flow between every pair of
/// participants. LiveKit is signaling-only: media is relayed through an SFU
/// and E2EE is layered on top via the sender-key ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CallBackend {
    Mesh,
    Livekit {
        livekit_service_url: String,
        livekit_alias: String,
    },
}

impl CallBackend {
    pub fn is_livekit(&self) -> bool {
        matches!(self, Self::Livekit { .. })
    }

    /// Whether two backends are the same kind, ignoring SFU endpoint details.
    pub fn same_kind(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Mesh, Self::Mesh) | (Self::Livekit { .. }, Self::Livekit { .. })
        )
    }
}

/// A validated membership entry for one (user, device) in one group call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMembership {
    pub user_id: String,
    pub room_id: String,
    pub call_id: String,
    pub device_id: String,
    pub application: String,
    pub scope: String,
    pub backend: CallBackend,
    pub membership_id: String,
    /// Wall-clock expiry, milliseconds since the epoch.
    pub expires_ts: i64,
}

impl CallMembership {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_ts <= now_ms
    }

    pub fn participant(&self) -> Participant {
        Participant::new(self.user_id.clone(), Some(self.device_id.clone()))
    }

    /// Serializes back to the wire shape used inside the `memberships` array.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "call_id": self.call_id,
            "device_id": self.device_id,
            "expires_ts": self.expires_ts,
            "foci_active": [self.backend],
            "application": self.application,
            "scope": self.scope,
            "membershipId": self.membership_id,
        })
    }
}

/// Wire shape of a single entry in the `memberships` array, all fields
/// optional so that validation can decide what to drop.
#[derive(Debug, Deserialize)]
struct RawMembership {
    call_id: Option<String>,
    device_id: Option<String>,
    expires_ts: Option<i64>,
    foci_active: Option<Vec<CallBackend>>,
    application: Option<String>,
    scope: Option<String>,
    #[serde(rename = "membershipId")]
    membership_id: Option<String>,
}

/// Parses one entry of a user's `memberships` array.
///
/// Entries missing `call_id`, `device_id`, `expires_ts` or `foci_active` are
/// malformed: they are dropped with a warning, never surfaced as errors.
pub fn parse_membership(user_id: &str, room_id: &str, raw: &Value) -> Option<CallMembership> {
    let raw: RawMembership = match serde_json::from_value(raw.clone()) {
        Ok(m) => m,
        Err(e) => {
            warn!("Discarding unparseable call membership of {user_id}: {e}");
            return None;
        }
    };

    let (Some(call_id), Some(device_id), Some(expires_ts), Some(foci)) = (
        raw.call_id,
        raw.device_id,
        raw.expires_ts,
        raw.foci_active,
    ) else {
        warn!("Discarding incomplete call membership of {user_id} (missing call_id, device_id, expires_ts or foci_active)");
        return None;
    };

    let Some(backend) = foci.into_iter().next() else {
        warn!("Discarding call membership of {user_id} with empty foci_active");
        return None;
    };

    Some(CallMembership {
        user_id: user_id.to_string(),
        room_id: room_id.to_string(),
        call_id,
        device_id,
        application: raw.application.unwrap_or_else(|| DEFAULT_APPLICATION.to_string()),
        scope: raw.scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
        backend,
        membership_id: raw.membership_id.unwrap_or_default(),
        expires_ts,
    })
}

/// Pulls the `memberships` array out of a member state event content.
pub fn memberships_array(content: &Value) -> Vec<Value> {
    content
        .get("memberships")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
