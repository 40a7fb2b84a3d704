//! Sender-key material and bookkeeping for SFU-backed E2EE calls.
//!
//! Every participant encrypts its outbound media with a 32-byte sender key,
//! distributed to the other participants over the encrypted device channel.
//! Keys live in 16 index slots cycled by a monotonic counter; rotating past
//! the 16th key overwrites the oldest slot.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::ids::Participant;

/// Number of sender-key index slots; indices cycle modulo this.
pub const KEY_INDEX_SLOTS: u64 = 16;

/// A 32-byte symmetric sender key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SenderKey([u8; 32]);

impl SenderKey {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        let bytes = BASE64.decode(encoded).ok()?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for SenderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.write_str("SenderKey(..)")
    }
}

/// Per-session key table: every participant's known keys by index slot,
/// plus the local allocation state.
///
/// `latest_local_index` is the most recently *generated* local key;
/// `current_local_index` the one actually installed in the encryptor. The
/// latter may lag across the install delay that gives peers time to pick up
/// a new key before we start using it.
#[derive(Default)]
pub struct SenderKeyTable {
    keys: HashMap<Participant, HashMap<u8, SenderKey>>,
    current_local_index: u8,
    latest_local_index: u8,
    counter: u64,
}

impl SenderKeyTable {
    /// Allocates the next key index slot.
    pub fn allocate_index(&mut self) -> u8 {
        let idx = (self.counter % KEY_INDEX_SLOTS) as u8;
        self.counter += 1;
        idx
    }

    pub fn insert(&mut self, participant: &Participant, index: u8, key: SenderKey) {
        self.keys
            .entry(participant.clone())
            .or_default()
            .insert(index, key);
    }

    pub fn get(&self, participant: &Participant, index: u8) -> Option<&SenderKey> {
        self.keys.get(participant)?.get(&index)
    }

    pub fn key_count(&self, participant: &Participant) -> usize {
        self.keys.get(participant).map_or(0, HashMap::len)
    }

    pub fn remove_participant(&mut self, participant: &Participant) {
        self.keys.remove(participant);
    }

    pub fn current_local_index(&self) -> u8 {
        self.current_local_index
    }

    pub fn set_current_local_index(&mut self, index: u8) {
        self.current_local_index = index;
    }

    pub fn latest_local_index(&self) -> u8 {
        self.latest_local_index
    }

    pub fn set_latest_local_index(&mut self, index: u8) {
        self.latest_local_index = index;
    }

    /// Purges the local participant's keys and resets both indices; called
    /// on leave so a rejoin starts from a clean ladder.
    pub fn reset_local(&mut self, local: &Participant) {
        self.keys.remove(local);
        self.current_local_index = 0;
        self.latest_local_index = 0;
        self.counter = 0;
    }
}

/// One `{index, key}` pair on the wire, key base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyEntry {
    pub index: u8,
    pub key: String,
}

/// Payload of the encryption-keys to-device event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeysEventContent {
    pub keys: Vec<EncryptionKeyEntry>,
    pub call_id: String,
    pub conf_id: String,
    pub device_id: String,
    pub room_id: String,
}

/// Payload of the key-request to-device event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeysRequestContent {
    pub conf_id: String,
    pub device_id: String,
    pub room_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> Participant {
        Participant::new("@me:srv", Some("DEV".into()))
    }

    #[test]
    fn test_index_allocation_cycles_mod_16() {
        let mut table = SenderKeyTable::default();
        for expected in 0..16u8 {
            assert_eq!(table.allocate_index(), expected);
        }
        // The 17th allocation wraps to slot 0.
        assert_eq!(table.allocate_index(), 0);
        assert_eq!(table.allocate_index(), 1);
    }

    #[test]
    fn test_table_keeps_at_most_16_entries() {
        let mut table = SenderKeyTable::default();
        let me = local();
        for _ in 0..40 {
            let idx = table.allocate_index();
            table.insert(&me, idx, SenderKey::generate());
        }
        assert_eq!(table.key_count(&me), 16);
    }

    #[test]
    fn test_wraparound_overwrites_oldest_slot() {
        let mut table = SenderKeyTable::default();
        let me = local();
        let mut first = None;
        for _ in 0..16 {
            let idx = table.allocate_index();
            let key = SenderKey::generate();
            if idx == 0 {
                first = Some(key.clone());
            }
            table.insert(&me, idx, key);
        }

        let idx = table.allocate_index();
        assert_eq!(idx, 0);
        let replacement = SenderKey::generate();
        table.insert(&me, idx, replacement.clone());
        assert_ne!(table.get(&me, 0), first.as_ref());
        assert_eq!(table.get(&me, 0), Some(&replacement));
    }

    #[test]
    fn test_base64_round_trip() {
        let key = SenderKey::generate();
        let encoded = key.to_base64();
        let decoded = SenderKey::from_base64(&encoded).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(SenderKey::from_bytes(&[0u8; 31]).is_none());
        assert!(SenderKey::from_bytes(&[0u8; 33]).is_none());
        assert!(SenderKey::from_bytes(&[7u8; 32]).is_some());
    }

    #[test]
    fn test_reset_local_clears_keys_and_indices() {
        let mut table = SenderKeyTable::default();
        let me = local();
        for _ in 0..5 {
            let idx = table.allocate_index();
            table.insert(&me, idx, SenderKey::generate());
            table.set_latest_local_index(idx);
            table.set_current_local_index(idx);
        }

        table.reset_local(&me);
        assert_eq!(table.key_count(&me), 0);
        assert_eq!(table.current_local_index(), 0);
        assert_eq!(table.latest_local_index(), 0);
        assert_eq!(table.allocate_index(), 0);
    }

    #[test]
    fn test_keys_event_payload_shape() {
        let content = EncryptionKeysEventContent {
            keys: vec![EncryptionKeyEntry {
                index: 3,
                key: SenderKey::generate().to_base64(),
            }],
            call_id: "conf".into(),
            conf_id: "conf".into(),
            device_id: "DEV".into(),
            room_id: "!r:srv".into(),
        };
        let wire = serde_json::to_value(&content).unwrap();
        assert_eq!(wire["keys"][0]["index"], 3);
        assert_eq!(wire["conf_id"], "conf");
        let back: EncryptionKeysEventContent = serde_json::from_value(wire).unwrap();
        assert_eq!(back.keys.len(), 1);
    }
}
