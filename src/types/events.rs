use tokio::sync::{broadcast, watch};

use crate::session::GroupCallState;
use crate::streams::WrappedMediaStream;
use crate::types::ids::Participant;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Coarse lifecycle events mirrored onto a single stream for observers that
/// only want "something changed" granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCallEvent {
    GroupCallStateChanged,
    ParticipantsChanged,
    CallsChanged,
    ActiveSpeakerChanged,
    LocalScreenshareStateChanged,
    LocalMuteStateChanged,
    Error,
}

// Macro to generate CallEventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus of one group call session.
        ///
        /// Each stream is an independent multi-consumer broadcast channel.
        /// The lifecycle state uses a watch channel instead so that a
        /// subscriber attaching after `enter()` still observes the current
        /// state.
        #[derive(Debug)]
        pub struct CallEventBus {
            pub state: watch::Sender<GroupCallState>,
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl CallEventBus {
            pub fn new() -> Self {
                Self {
                    state: watch::channel(GroupCallState::default()).0,
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

// Define the CallEventBus structure and implementation using the macro
define_event_bus! {
    // Coarse lifecycle stream
    (event, GroupCallEvent),

    // Stream and peer-call bookkeeping
    (feeds_changed, ()),
    (calls_changed, ()),
    (stream_added, WrappedMediaStream),
    (stream_removed, WrappedMediaStream),

    // Participant and speaker changes
    (participants_changed, Vec<Participant>),
    (active_speaker_changed, Participant),

    // Error surface
    (error, String),
}

impl CallEventBus {
    /// Current state plus future transitions; the receiver is primed with
    /// the latest value.
    pub fn subscribe_state(&self) -> watch::Receiver<GroupCallState> {
        self.state.subscribe()
    }

    pub(crate) fn emit(&self, event: GroupCallEvent) {
        let _ = self.event.send(event);
    }

    pub(crate) fn emit_error(&self, message: impl Into<String>) {
        let _ = self.error.send(message.into());
        self.emit(GroupCallEvent::Error);
    }
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}
