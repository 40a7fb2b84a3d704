//! Tunable durations and feature flags for group call sessions.

use std::time::Duration;

/// Configuration for a group call session.
///
/// The defaults mirror production behavior; tests shrink the durations to
/// keep the suite fast.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Validity window written into our membership entry on every refresh.
    pub expire_ts_bump: Duration,
    /// Period of the membership heartbeat that re-bumps `expires_ts`.
    pub update_expire_ts_interval: Duration,
    /// Period of the active-speaker statistics poll.
    pub active_speaker_interval: Duration,
    /// Debounce window coalescing key rotations when participants leave.
    pub make_key_delay: Duration,
    /// Delay before the local encryptor switches to a freshly distributed
    /// key, giving peers time to install it first.
    pub use_key_delay: Duration,
    /// Ratchet the existing sender key toward joiners instead of generating
    /// a whole new key.
    pub enable_key_ratcheting: bool,
    /// Run the sender-key ladder for this call (SFU backends only).
    pub enable_e2ee: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            expire_ts_bump: Duration::from_secs(45),
            update_expire_ts_interval: Duration::from_secs(15),
            active_speaker_interval: Duration::from_secs(1),
            make_key_delay: Duration::from_secs(3),
            use_key_delay: Duration::from_secs(5),
            enable_key_ratcheting: false,
            enable_e2ee: true,
        }
    }
}

/// Bound on to-device key send retries.
pub(crate) const SEND_KEY_ATTEMPTS: u32 = 3;

/// Bound on retries when the key provider's ratchet returns empty bytes.
pub(crate) const RATCHET_ATTEMPTS: u32 = 3;
