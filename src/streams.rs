//! Media stream bookkeeping for a group call session.
//!
//! Streams come in two flavors: local streams produced by this session
//! (owned here, stopped exactly once when removed or on leave) and remote
//! streams produced by peer calls (referenced here, their lifetime belongs
//! to the owning peer call).

use log::warn;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::services::MediaStream;
use crate::types::events::CallEventBus;
use crate::types::ids::Participant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPurpose {
    UserMedia,
    Screenshare,
}

struct StreamInner {
    participant: Participant,
    purpose: StreamPurpose,
    is_local: bool,
    stream: Arc<dyn MediaStream>,
    audio_muted: AtomicBool,
    video_muted: AtomicBool,
    stopped: AtomicBool,
}

/// A media stream annotated with its producer and purpose.
///
/// Cloning is cheap; all clones share mute flags and the stop latch.
#[derive(Clone)]
pub struct WrappedMediaStream {
    inner: Arc<StreamInner>,
}

impl WrappedMediaStream {
    pub fn new(
        participant: Participant,
        purpose: StreamPurpose,
        is_local: bool,
        stream: Arc<dyn MediaStream>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                participant,
                purpose,
                is_local,
                stream,
                audio_muted: AtomicBool::new(false),
                video_muted: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn participant(&self) -> &Participant {
        &self.inner.participant
    }

    pub fn purpose(&self) -> StreamPurpose {
        self.inner.purpose
    }

    pub fn is_local(&self) -> bool {
        self.inner.is_local
    }

    pub fn stream_id(&self) -> &str {
        self.inner.stream.id()
    }

    pub fn audio_muted(&self) -> bool {
        self.inner.audio_muted.load(Ordering::SeqCst)
    }

    pub fn set_audio_muted(&self, muted: bool) {
        self.inner.audio_muted.store(muted, Ordering::SeqCst);
    }

    pub fn video_muted(&self) -> bool {
        self.inner.video_muted.load(Ordering::SeqCst)
    }

    pub fn set_video_muted(&self, muted: bool) {
        self.inner.video_muted.store(muted, Ordering::SeqCst);
    }

    /// Stops the underlying handle. Subsequent calls are no-ops; returns
    /// whether this call performed the stop.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.stream.stop();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl PartialEq for WrappedMediaStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WrappedMediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedMediaStream")
            .field("participant", &self.inner.participant.canonical_id())
            .field("purpose", &self.inner.purpose)
            .field("is_local", &self.inner.is_local)
            .field("stream_id", &self.inner.stream.id())
            .finish()
    }
}

/// Ordered user-media and screenshare streams of one group call, keyed by
/// participant canonical id within each purpose.
#[derive(Default)]
pub struct StreamRegistry {
    user_media: Vec<WrappedMediaStream>,
    screenshare: Vec<WrappedMediaStream>,
}

impl StreamRegistry {
    fn list(&self, purpose: StreamPurpose) -> &Vec<WrappedMediaStream> {
        match purpose {
            StreamPurpose::UserMedia => &self.user_media,
            StreamPurpose::Screenshare => &self.screenshare,
        }
    }

    fn list_mut(&mut self, purpose: StreamPurpose) -> &mut Vec<WrappedMediaStream> {
        match purpose {
            StreamPurpose::UserMedia => &mut self.user_media,
            StreamPurpose::Screenshare => &mut self.screenshare,
        }
    }

    pub fn user_media_streams(&self) -> &[WrappedMediaStream] {
        &self.user_media
    }

    pub fn screenshare_streams(&self) -> &[WrappedMediaStream] {
        &self.screenshare
    }

    pub fn get(&self, purpose: StreamPurpose, participant: &Participant) -> Option<&WrappedMediaStream> {
        self.list(purpose)
            .iter()
            .find(|s| s.participant() == participant)
    }

    /// Every local stream, both purposes, in registration order.
    pub fn local_streams(&self) -> Vec<WrappedMediaStream> {
        self.user_media
            .iter()
            .chain(self.screenshare.iter())
            .filter(|s| s.is_local())
            .cloned()
            .collect()
    }

    /// Adds a stream; a same-participant stream of the same purpose is
    /// replaced instead.
    pub fn add(&mut self, bus: &CallEventBus, stream: WrappedMediaStream) {
        let purpose = stream.purpose();
        let existing = self
            .list(purpose)
            .iter()
            .position(|s| s.participant() == stream.participant());
        match existing {
            Some(idx) => {
                let old = self.list_mut(purpose)[idx].clone();
                self.replace_at(bus, purpose, idx, stream, &old);
                return;
            }
            None => self.list_mut(purpose).push(stream.clone()),
        }
        if !stream.is_local() {
            let _ = bus.stream_added.send(stream);
        }
        let _ = bus.feeds_changed.send(());
    }

    /// Replaces the stream of `stream.participant()`; falls back to add when
    /// none is present yet.
    pub fn replace(&mut self, bus: &CallEventBus, stream: WrappedMediaStream) {
        self.add(bus, stream);
    }

    fn replace_at(
        &mut self,
        bus: &CallEventBus,
        purpose: StreamPurpose,
        idx: usize,
        stream: WrappedMediaStream,
        old: &WrappedMediaStream,
    ) {
        if old.is_local() {
            old.stop();
        }
        self.list_mut(purpose)[idx] = stream;
        let _ = bus.feeds_changed.send(());
    }

    /// Removes the participant's stream of the given purpose. Stops the
    /// underlying handle only for local streams. Idempotent.
    pub fn remove(
        &mut self,
        bus: &CallEventBus,
        purpose: StreamPurpose,
        participant: &Participant,
    ) -> Option<WrappedMediaStream> {
        let idx = self
            .list(purpose)
            .iter()
            .position(|s| s.participant() == participant)?;
        let stream = self.list_mut(purpose).remove(idx);
        if stream.is_local() {
            stream.stop();
        }
        if !stream.is_local() {
            let _ = bus.stream_removed.send(stream.clone());
        }
        let _ = bus.feeds_changed.send(());
        Some(stream)
    }

    /// Removes every stream of a participant, both purposes.
    pub fn remove_all_for(&mut self, bus: &CallEventBus, participant: &Participant) {
        self.remove(bus, StreamPurpose::UserMedia, participant);
        self.remove(bus, StreamPurpose::Screenshare, participant);
    }

    /// Stops and drops everything; used on leave.
    pub fn clear(&mut self, bus: &CallEventBus) {
        for stream in self.user_media.drain(..).chain(self.screenshare.drain(..)) {
            if stream.is_local() {
                stream.stop();
            } else if !stream.is_stopped() {
                // Remote streams are stopped by their owning peer call; just
                // announce the removal.
                let _ = bus.stream_removed.send(stream.clone());
            }
        }
        let _ = bus.feeds_changed.send(());
    }

    /// Sanity accessor used by the session when wiring peer streams: warns
    /// when a duplicate slips in.
    pub fn assert_single(&self, purpose: StreamPurpose, participant: &Participant) {
        let count = self
            .list(purpose)
            .iter()
            .filter(|s| s.participant() == participant)
            .count();
        if count > 1 {
            warn!(
                "Registry holds {count} {purpose:?} streams for {}",
                participant.canonical_id()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeStream {
        id: String,
        stops: AtomicUsize,
    }

    impl FakeStream {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl MediaStream for FakeStream {
        fn id(&self) -> &str {
            &self.id
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn participant(name: &str) -> Participant {
        Participant::new(name, Some("dev".into()))
    }

    fn wrapped(name: &str, local: bool, raw: &Arc<FakeStream>) -> WrappedMediaStream {
        WrappedMediaStream::new(
            participant(name),
            StreamPurpose::UserMedia,
            local,
            raw.clone(),
        )
    }

    #[test]
    fn test_local_stream_stopped_exactly_once() {
        let raw = FakeStream::new("s1");
        let stream = wrapped("@a:s", true, &raw);

        assert!(stream.stop());
        assert!(!stream.stop());
        assert_eq!(raw.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_stops_local_only() {
        let bus = CallEventBus::new();
        let mut reg = StreamRegistry::default();

        let local_raw = FakeStream::new("local");
        let remote_raw = FakeStream::new("remote");
        reg.add(&bus, wrapped("@a:s", true, &local_raw));
        reg.add(&bus, wrapped("@b:s", false, &remote_raw));

        reg.remove(&bus, StreamPurpose::UserMedia, &participant("@a:s"));
        reg.remove(&bus, StreamPurpose::UserMedia, &participant("@b:s"));

        assert_eq!(local_raw.stops.load(Ordering::SeqCst), 1);
        assert_eq!(remote_raw.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let bus = CallEventBus::new();
        let mut reg = StreamRegistry::default();
        let raw = FakeStream::new("s");
        reg.add(&bus, wrapped("@a:s", true, &raw));

        assert!(reg.remove(&bus, StreamPurpose::UserMedia, &participant("@a:s")).is_some());
        assert!(reg.remove(&bus, StreamPurpose::UserMedia, &participant("@a:s")).is_none());
        assert_eq!(raw.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_additions_not_on_stream_added() {
        let bus = CallEventBus::new();
        let mut added = bus.stream_added.subscribe();
        let mut reg = StreamRegistry::default();

        reg.add(&bus, wrapped("@a:s", true, &FakeStream::new("l")));
        assert!(added.try_recv().is_err());

        reg.add(&bus, wrapped("@b:s", false, &FakeStream::new("r")));
        let got = added.try_recv().unwrap();
        assert_eq!(got.participant(), &participant("@b:s"));
    }

    #[test]
    fn test_add_replaces_same_participant() {
        let bus = CallEventBus::new();
        let mut reg = StreamRegistry::default();
        let first = FakeStream::new("first");
        let second = FakeStream::new("second");

        reg.add(&bus, wrapped("@a:s", true, &first));
        reg.add(&bus, wrapped("@a:s", true, &second));

        assert_eq!(reg.user_media_streams().len(), 1);
        assert_eq!(reg.user_media_streams()[0].stream_id(), "second");
        // The replaced local stream is stopped.
        assert_eq!(first.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_stops_local_streams() {
        let bus = CallEventBus::new();
        let mut reg = StreamRegistry::default();
        let local = FakeStream::new("l");
        let remote = FakeStream::new("r");
        reg.add(&bus, wrapped("@a:s", true, &local));
        reg.add(&bus, wrapped("@b:s", false, &remote));

        reg.clear(&bus);
        assert_eq!(local.stops.load(Ordering::SeqCst), 1);
        assert_eq!(remote.stops.load(Ordering::SeqCst), 0);
        assert!(reg.user_media_streams().is_empty());
    }
}
