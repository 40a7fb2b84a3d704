//! Active-speaker detection state.
//!
//! The session polls audio-level statistics from the peer transports on a
//! fixed interval and feeds the samples in here; the active speaker is the
//! participant with the highest level seen in the latest window.

use std::collections::HashMap;

use crate::types::ids::Participant;

#[derive(Default)]
pub struct ActiveSpeakerState {
    levels: HashMap<Participant, f64>,
    active: Option<Participant>,
}

impl ActiveSpeakerState {
    pub fn update_level(&mut self, participant: Participant, level: f64) {
        self.levels.insert(participant, level);
    }

    pub fn active(&self) -> Option<&Participant> {
        self.active.as_ref()
    }

    /// Recomputes the argmax over the level map. Returns the new active
    /// speaker when it changed, `None` otherwise.
    pub fn recompute(&mut self) -> Option<Participant> {
        let loudest = self
            .levels
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(p, _)| p.clone())?;
        if Some(&loudest) != self.active.as_ref() {
            self.active = Some(loudest.clone());
            return Some(loudest);
        }
        None
    }

    /// Drops a participant's sample; when they were the active speaker,
    /// falls back to the given replacement.
    pub fn remove_participant(&mut self, participant: &Participant, fallback: Option<Participant>) {
        self.levels.remove(participant);
        if self.active.as_ref() == Some(participant) {
            self.active = fallback;
        }
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.active = None;
    }
}
