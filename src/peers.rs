//! Table of active peer calls, one per remote participant.
//!
//! Each entry owns the forwarder tasks subscribed to its call's event
//! streams; removing the entry aborts the forwarders so no subscription
//! outlives its peer call.

use log::warn;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::GroupCallError;
use crate::services::MediaTransport;
use crate::types::ids::Participant;

pub struct PeerEntry {
    pub call: Arc<dyn MediaTransport>,
    forwarders: Vec<JoinHandle<()>>,
}

impl PeerEntry {
    pub fn abort_forwarders(&self) {
        for handle in &self.forwarders {
            handle.abort();
        }
    }
}

#[derive(Default)]
pub struct PeerCallTable {
    entries: Vec<PeerEntry>,
}

impl PeerCallTable {
    pub fn add(&mut self, call: Arc<dyn MediaTransport>, forwarders: Vec<JoinHandle<()>>) {
        self.entries.push(PeerEntry { call, forwarders });
    }

    /// Swaps the entry holding `old_call_id` for `replacement` in place,
    /// returning the displaced entry with its forwarders already aborted.
    pub fn replace(
        &mut self,
        old_call_id: &str,
        replacement: Arc<dyn MediaTransport>,
        forwarders: Vec<JoinHandle<()>>,
    ) -> Result<PeerEntry, GroupCallError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.call.call_id() == old_call_id)
            .ok_or_else(|| GroupCallError::PeerCallMissing(old_call_id.to_string()))?;
        let old = std::mem::replace(&mut self.entries[idx], PeerEntry {
            call: replacement,
            forwarders,
        });
        old.abort_forwarders();
        Ok(old)
    }

    /// Removes the entry for `call_id`, aborting its forwarders. Idempotent.
    pub fn remove(&mut self, call_id: &str) -> Option<PeerEntry> {
        let idx = self.entries.iter().position(|e| e.call.call_id() == call_id)?;
        let entry = self.entries.remove(idx);
        entry.abort_forwarders();
        Some(entry)
    }

    pub fn get_by_call_id(&self, call_id: &str) -> Option<Arc<dyn MediaTransport>> {
        self.entries
            .iter()
            .find(|e| e.call.call_id() == call_id)
            .map(|e| e.call.clone())
    }

    /// Single lookup by remote participant; more than one match violates the
    /// one-call-per-participant invariant and is logged.
    pub fn get_for_participant(&self, participant: &Participant) -> Option<Arc<dyn MediaTransport>> {
        let mut matches = self
            .entries
            .iter()
            .filter(|e| &e.call.remote_participant() == participant);
        let first = matches.next().map(|e| e.call.clone());
        if matches.next().is_some() {
            warn!(
                "More than one peer call for participant {}",
                participant.canonical_id()
            );
        }
        first
    }

    pub fn calls(&self) -> Vec<Arc<dyn MediaTransport>> {
        self.entries.iter().map(|e| e.call.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the table, aborting every entry's forwarders; used on leave.
    pub fn drain(&mut self) -> Vec<PeerEntry> {
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            entry.abort_forwarders();
        }
        entries
    }
}
