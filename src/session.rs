//! The group call session: the authoritative local view of one group call.
//!
//! A session reconciles the room's membership state with a table of peer
//! calls (full mesh) or with the SFU sender-key ladder (LiveKit), keeps the
//! local membership entry refreshed, polls audio levels for the active
//! speaker and publishes everything on a typed event bus.
//!
//! All public entry points and internal callbacks run on the tokio runtime;
//! shared state lives behind the session's own locks and background work is
//! cancelled through a single shutdown notifier.

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{CallConfig, RATCHET_ATTEMPTS, SEND_KEY_ATTEMPTS};
use crate::e2ee::{
    EncryptionKeyEntry, EncryptionKeysEventContent, EncryptionKeysRequestContent, SenderKey,
    SenderKeyTable,
};
use crate::error::{GroupCallError, ServiceError};
use crate::member_view::MembershipView;
use crate::peers::PeerCallTable;
use crate::registry::CallRegistry;
use crate::services::{
    CallDirection, DeviceMessenger, ENCRYPTION_KEYS_EVENT_TYPE, HangupReason, KeyProvider,
    MediaDevices, MediaTransport, PeerCallFactory, PeerCallOptions, PeerCallState, PeerCallType,
    RoomService,
};
use crate::speaker::ActiveSpeakerState;
use crate::streams::{StreamPurpose, StreamRegistry, WrappedMediaStream};
use crate::types::events::{CallEventBus, GroupCallEvent};
use crate::types::ids::{Participant, VoipId};
use crate::types::member::{CallBackend, CallMembership, memberships_array, parse_membership};

/// Lifecycle state of a group call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupCallState {
    #[default]
    LocalFeedUninitialized,
    InitializingLocalFeed,
    LocalFeedInitialized,
    Entered,
    Ended,
}

/// Capability handles the session needs from the surrounding client.
#[derive(Clone)]
pub struct SessionContext {
    pub room: Arc<dyn RoomService>,
    pub messenger: Arc<dyn DeviceMessenger>,
    pub key_provider: Arc<dyn KeyProvider>,
    pub media_devices: Arc<dyn MediaDevices>,
    pub factory: Arc<dyn PeerCallFactory>,
    pub registry: Arc<CallRegistry>,
}

pub struct GroupCallSession {
    id: VoipId,
    local: Participant,
    application: String,
    scope: String,
    backend: CallBackend,
    config: CallConfig,
    /// Opaque per-session id; distinguishes successive joins by this device
    /// and rides along as the signaling party id.
    membership_id: String,

    room: Arc<dyn RoomService>,
    messenger: Arc<dyn DeviceMessenger>,
    key_provider: Arc<dyn KeyProvider>,
    media_devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn PeerCallFactory>,
    registry: Arc<CallRegistry>,
    view: MembershipView,

    state: RwLock<GroupCallState>,
    participants: RwLock<Vec<Participant>>,
    streams: RwLock<StreamRegistry>,
    peers: RwLock<PeerCallTable>,
    speaker: Mutex<ActiveSpeakerState>,
    keys: Mutex<SenderKeyTable>,

    pending_installs: Mutex<Vec<JoinHandle<()>>>,
    rotation_debounce: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Notify,

    pub events: CallEventBus,
}

/// 32 uppercase hex characters, used for peer call ids and membership ids.
fn random_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

impl GroupCallSession {
    pub fn new(
        id: VoipId,
        local: Participant,
        backend: CallBackend,
        application: impl Into<String>,
        scope: impl Into<String>,
        config: CallConfig,
        ctx: SessionContext,
    ) -> Arc<Self> {
        let view = MembershipView::new(ctx.room.clone(), id.room_id.clone());
        Arc::new(Self {
            id,
            local,
            application: application.into(),
            scope: scope.into(),
            backend,
            config,
            membership_id: random_id(),

            room: ctx.room,
            messenger: ctx.messenger,
            key_provider: ctx.key_provider,
            media_devices: ctx.media_devices,
            factory: ctx.factory,
            registry: ctx.registry,
            view,

            state: RwLock::new(GroupCallState::default()),
            participants: RwLock::new(Vec::new()),
            streams: RwLock::new(StreamRegistry::default()),
            peers: RwLock::new(PeerCallTable::default()),
            speaker: Mutex::new(ActiveSpeakerState::default()),
            keys: Mutex::new(SenderKeyTable::default()),

            pending_installs: Mutex::new(Vec::new()),
            rotation_debounce: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: Notify::new(),

            events: CallEventBus::new(),
        })
    }

    pub fn voip_id(&self) -> &VoipId {
        &self.id
    }

    pub fn local_participant(&self) -> &Participant {
        &self.local
    }

    pub fn membership_id(&self) -> &str {
        &self.membership_id
    }

    pub fn backend(&self) -> &CallBackend {
        &self.backend
    }

    /// The room's membership projection this session reconciles against.
    pub fn membership_view(&self) -> &MembershipView {
        &self.view
    }

    pub async fn state(&self) -> GroupCallState {
        *self.state.read().await
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.participants.read().await.clone()
    }

    pub async fn calls(&self) -> Vec<Arc<dyn MediaTransport>> {
        self.peers.read().await.calls()
    }

    pub async fn active_speaker(&self) -> Option<Participant> {
        self.speaker.lock().await.active().cloned()
    }

    pub async fn local_streams(&self) -> Vec<WrappedMediaStream> {
        self.streams.read().await.local_streams()
    }

    pub async fn local_user_media_stream(&self) -> Option<WrappedMediaStream> {
        self.streams
            .read()
            .await
            .get(StreamPurpose::UserMedia, &self.local)
            .cloned()
    }

    pub async fn is_screensharing(&self) -> bool {
        self.streams
            .read()
            .await
            .get(StreamPurpose::Screenshare, &self.local)
            .is_some()
    }

    /// `(current, latest)` local key index pair.
    pub async fn local_key_indices(&self) -> (u8, u8) {
        let keys = self.keys.lock().await;
        (keys.current_local_index(), keys.latest_local_index())
    }

    pub async fn known_key_count(&self, participant: &Participant) -> usize {
        self.keys.lock().await.key_count(participant)
    }

    async fn set_state(&self, new: GroupCallState) {
        {
            let mut state = self.state.write().await;
            if *state == new {
                return;
            }
            *state = new;
        }
        self.events.state.send_replace(new);
        self.events.emit(GroupCallEvent::GroupCallStateChanged);
    }

    // ==================== Lifecycle ====================

    /// Acquires the local user-media stream (mesh only).
    ///
    /// On failure the state returns to `LocalFeedUninitialized` and the
    /// error propagates to the caller.
    pub async fn init_local_stream(&self) -> Result<(), GroupCallError> {
        if self.backend.is_livekit() {
            return Ok(());
        }
        let state = self.state().await;
        if state != GroupCallState::LocalFeedUninitialized {
            return Err(GroupCallError::WrongState {
                operation: "init_local_stream",
                state,
            });
        }
        self.set_state(GroupCallState::InitializingLocalFeed).await;

        match self.media_devices.get_user_media().await {
            Ok(raw) => {
                let stream = WrappedMediaStream::new(
                    self.local.clone(),
                    StreamPurpose::UserMedia,
                    true,
                    raw,
                );
                self.streams.write().await.add(&self.events, stream);
                self.set_state(GroupCallState::LocalFeedInitialized).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(GroupCallState::LocalFeedUninitialized).await;
                Err(GroupCallError::MediaAcquisition(e))
            }
        }
    }

    /// Joins the group call: publishes our membership, reconciles the
    /// participant set, wires incoming-call handling (mesh) and registers
    /// the session in the owning registry.
    pub async fn enter(self: &Arc<Self>) -> Result<(), GroupCallError> {
        let state = self.state().await;
        if !matches!(
            state,
            GroupCallState::LocalFeedUninitialized | GroupCallState::LocalFeedInitialized
        ) {
            return Err(GroupCallError::WrongState {
                operation: "enter",
                state,
            });
        }
        if state == GroupCallState::LocalFeedUninitialized && !self.backend.is_livekit() {
            self.init_local_stream().await?;
        }

        self.send_member_state_event().await?;
        self.speaker.lock().await.clear();
        self.set_state(GroupCallState::Entered).await;

        if self.backend.is_livekit() && self.config.enable_e2ee {
            // Fresh sender key with install delay so peers pick it up before
            // we start encrypting with it.
            self.make_new_sender_key(true).await?;
        }

        self.on_member_state_changed().await?;

        if !self.backend.is_livekit() {
            for call in self.factory.pending_incoming_calls().await {
                if let Err(e) = self.on_incoming_call(call).await {
                    warn!("Failed to process pending incoming call: {e}");
                }
            }

            let session = self.clone();
            let mut incoming = self.factory.incoming_calls();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = incoming.recv() => match result {
                            Ok(call) => {
                                if let Err(e) = session.on_incoming_call(call).await {
                                    warn!("Failed to handle incoming call: {e}");
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                warn!("Incoming-call stream lagged by {n} events");
                            }
                            Err(RecvError::Closed) => return,
                        },
                        _ = session.shutdown.notified() => return,
                    }
                }
            });
            self.tasks.lock().await.push(handle);
        }

        self.tasks
            .lock()
            .await
            .push(tokio::spawn(self.clone().heartbeat_loop()));
        self.tasks
            .lock()
            .await
            .push(tokio::spawn(self.clone().active_speaker_loop()));

        self.registry.insert(self.clone()).await;
        Ok(())
    }

    /// Leaves the group call: stops local streams, hangs up every peer
    /// call, removes our membership, cancels all timers and deregisters the
    /// session.
    pub async fn leave(self: &Arc<Self>) -> Result<(), GroupCallError> {
        let state = self.state().await;
        if state != GroupCallState::Entered {
            return Err(GroupCallError::WrongState {
                operation: "leave",
                state,
            });
        }

        // Stop all background work before tearing state down so nothing
        // re-arms mid-teardown.
        self.shutdown.notify_waiters();
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        for handle in self.pending_installs.lock().await.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.rotation_debounce.lock().await.take() {
            handle.abort();
        }

        for entry in self.peers.write().await.drain() {
            if let Err(e) = entry.call.hangup(HangupReason::UserHangup, false).await {
                warn!("Hangup on leave failed for call {}: {e}", entry.call.call_id());
            }
        }

        self.streams.write().await.clear(&self.events);

        if let Err(e) = self.remove_member_state_event().await {
            warn!("Failed to remove call membership on leave: {e}");
        }

        self.keys.lock().await.reset_local(&self.local);
        self.speaker.lock().await.clear();
        {
            let mut participants = self.participants.write().await;
            if !participants.is_empty() {
                participants.clear();
                let _ = self.events.participants_changed.send(Vec::new());
                self.events.emit(GroupCallEvent::ParticipantsChanged);
            }
        }

        self.set_state(GroupCallState::Ended).await;
        self.registry.remove(&self.id).await;
        Ok(())
    }

    // ==================== Reconciliation ====================

    /// Reconciles the membership view with the peer call table and the key
    /// ladder. Invoked on room-state changes; a no-op unless entered.
    pub async fn on_member_state_changed(self: &Arc<Self>) -> Result<(), GroupCallError> {
        if self.state().await != GroupCallState::Entered {
            return Ok(());
        }

        let memberships = self
            .view
            .current(&self.id.call_id, &self.application, &self.scope)
            .await?;

        if !self.backend.is_livekit() {
            for m in &memberships {
                // Re-check after each suspension: the session may have left
                // while a peer call was being placed.
                if self.state().await != GroupCallState::Entered {
                    return Ok(());
                }
                if let Err(e) = self.reconcile_peer_call(m).await {
                    warn!(
                        "Failed to reconcile peer call for {}: {e}",
                        m.participant().canonical_id()
                    );
                }
            }
        }

        let mut new_participants: Vec<Participant> =
            memberships.iter().map(CallMembership::participant).collect();
        new_participants.sort();
        new_participants.dedup();

        let old = self.participants.read().await.clone();
        let joined: Vec<Participant> = new_participants
            .iter()
            .filter(|p| !old.contains(p))
            .cloned()
            .collect();
        let left: Vec<Participant> = old
            .iter()
            .filter(|p| !new_participants.contains(p))
            .cloned()
            .collect();
        *self.participants.write().await = new_participants.clone();

        if self.backend.is_livekit() && self.config.enable_e2ee {
            let joined_remote: Vec<Participant> =
                joined.iter().filter(|p| **p != self.local).cloned().collect();
            let left_remote: Vec<Participant> =
                left.iter().filter(|p| **p != self.local).cloned().collect();

            if !joined_remote.is_empty() {
                if self.config.enable_key_ratcheting {
                    if let Err(e) = self.ratchet_local_participant_key(Some(joined_remote)).await {
                        warn!("Key ratchet toward joiners failed: {e}");
                    }
                } else if let Err(e) = self.make_new_sender_key(true).await {
                    warn!("Key rotation for joiners failed: {e}");
                }
            }

            if !left_remote.is_empty() {
                {
                    let mut keys = self.keys.lock().await;
                    for p in &left_remote {
                        keys.remove_participant(p);
                    }
                }
                self.debounce_new_sender_key().await;
            }
        }

        if !joined.is_empty() || !left.is_empty() {
            let _ = self.events.participants_changed.send(new_participants);
            self.events.emit(GroupCallEvent::ParticipantsChanged);
        }
        Ok(())
    }

    /// Ensures exactly one live peer call toward `m`'s participant,
    /// honoring the initiation tie-break and replacing stale sessions.
    async fn reconcile_peer_call(self: &Arc<Self>, m: &CallMembership) -> Result<(), GroupCallError> {
        let participant = m.participant();
        if participant == self.local {
            return Ok(());
        }
        // Tie-break: the lexicographically smaller canonical id initiates.
        if self.local.canonical_id() >= participant.canonical_id() {
            return Ok(());
        }

        let existing = self.peers.read().await.get_for_participant(&participant);
        if let Some(existing) = existing {
            if existing.remote_session_id().as_deref() == Some(m.membership_id.as_str()) {
                return Ok(());
            }
            // The remote restarted with a new membership id; the old call is
            // a stale session.
            info!(
                "Replacing stale peer session for {} (call {})",
                participant.canonical_id(),
                existing.call_id()
            );
            self.remove_peer_call(existing, HangupReason::UnknownError)
                .await;
        }

        let opts = PeerCallOptions {
            call_id: random_id(),
            room_id: self.id.room_id.clone(),
            group_call_id: self.id.call_id.clone(),
            direction: CallDirection::Outgoing,
            call_type: PeerCallType::Video,
            local_party_id: self.membership_id.clone(),
            ice_servers: self.factory.ice_servers().await,
            remote_user_id: m.user_id.clone(),
            remote_device_id: Some(m.device_id.clone()),
            remote_session_id: m.membership_id.clone(),
        };
        let call = self.factory.create_call(opts).await?;
        let local_streams = self.streams.read().await.local_streams();
        call.place_call_with_streams(local_streams).await?;
        self.add_peer_call(call).await;
        Ok(())
    }

    /// Handles an incoming peer call surfaced by the factory.
    ///
    /// Calls for other rooms or not in ringing state are ignored; calls with
    /// a missing or mismatched group call id are hung up and surface to the
    /// caller as a stale-session error.
    pub async fn on_incoming_call(
        self: &Arc<Self>,
        call: Arc<dyn MediaTransport>,
    ) -> Result<(), GroupCallError> {
        if call.room_id() != self.id.room_id {
            return Ok(());
        }
        if call.state() != PeerCallState::Ringing {
            debug!("Ignoring incoming call {} not in ringing state", call.call_id());
            return Ok(());
        }
        if call.group_call_id().as_deref() != Some(self.id.call_id.as_str()) {
            let err = GroupCallError::StaleSession(format!(
                "incoming call {} targets group call {:?}, not {}",
                call.call_id(),
                call.group_call_id(),
                self.id.call_id
            ));
            warn!("Rejecting incoming call: {err}");
            if let Err(e) = call.hangup(HangupReason::UnknownError, true).await {
                warn!("Reject hangup failed for call {}: {e}", call.call_id());
            }
            return Err(err);
        }
        if self.backend.is_livekit() {
            // Signaling-only backend: media never flows peer-to-peer.
            return Ok(());
        }
        if self.state().await != GroupCallState::Entered {
            return Ok(());
        }

        let participant = call.remote_participant();
        let existing = self.peers.read().await.get_for_participant(&participant);
        match existing {
            Some(existing) if existing.call_id() == call.call_id() => return Ok(()),
            Some(existing) => {
                self.replace_peer_call(existing, call.clone()).await?;
            }
            None => self.add_peer_call(call.clone()).await,
        }

        let local_streams = self.streams.read().await.local_streams();
        call.answer_with_streams(local_streams).await?;
        Ok(())
    }

    // ==================== Peer call table wiring ====================

    async fn add_peer_call(self: &Arc<Self>, call: Arc<dyn MediaTransport>) {
        let forwarders = self.spawn_forwarders(&call);
        self.peers.write().await.add(call, forwarders);
        let _ = self.events.calls_changed.send(());
        self.events.emit(GroupCallEvent::CallsChanged);
    }

    /// Swaps `existing` for `replacement` in place. The displaced call is
    /// hung up with `Replaced`, which the hangup forwarder ignores so the
    /// swap surfaces as a single `calls_changed`.
    async fn replace_peer_call(
        self: &Arc<Self>,
        existing: Arc<dyn MediaTransport>,
        replacement: Arc<dyn MediaTransport>,
    ) -> Result<(), GroupCallError> {
        let forwarders = self.spawn_forwarders(&replacement);
        self.peers
            .write()
            .await
            .replace(&existing.call_id(), replacement, forwarders)?;
        if let Err(e) = existing.hangup(HangupReason::Replaced, true).await {
            warn!("Hangup of replaced call {} failed: {e}", existing.call_id());
        }
        let _ = self.events.calls_changed.send(());
        self.events.emit(GroupCallEvent::CallsChanged);
        Ok(())
    }

    /// Drops a peer call from the table. Unless the call was replaced, it
    /// is hung up (without re-emitting) and the participant's streams are
    /// removed. Idempotent.
    async fn remove_peer_call(self: &Arc<Self>, call: Arc<dyn MediaTransport>, reason: HangupReason) {
        if self.peers.write().await.remove(&call.call_id()).is_none() {
            return;
        }
        if reason != HangupReason::Replaced
            && let Err(e) = call.hangup(reason, false).await
        {
            warn!("Hangup failed for call {}: {e}", call.call_id());
        }

        let participant = call.remote_participant();
        {
            let mut streams = self.streams.write().await;
            streams.remove_all_for(&self.events, &participant);
            let fallback = streams
                .user_media_streams()
                .first()
                .map(|s| s.participant().clone());
            self.speaker
                .lock()
                .await
                .remove_participant(&participant, fallback);
        }
        let _ = self.events.calls_changed.send(());
        self.events.emit(GroupCallEvent::CallsChanged);
    }

    /// Subscribes to one peer call's event streams, fanning them back into
    /// the session. The returned handles are owned by the call's table
    /// entry and aborted when it goes.
    fn spawn_forwarders(self: &Arc<Self>, call: &Arc<dyn MediaTransport>) -> Vec<JoinHandle<()>> {
        let events = call.events();
        let mut handles = Vec::new();

        let mut state_rx = events.state;
        let session = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match state_rx.recv().await {
                    Ok(_) => {
                        let _ = session.events.calls_changed.send(());
                        session.events.emit(GroupCallEvent::CallsChanged);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }));

        let mut hangup_rx = events.hangup;
        let session = self.clone();
        let hangup_call = call.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match hangup_rx.recv().await {
                    // A replacement already swapped the table entry; the
                    // Replaced hangup must not trigger removal.
                    Ok(HangupReason::Replaced) => continue,
                    Ok(reason) => {
                        // Removal aborts this very forwarder, so it runs on
                        // its own task.
                        let session = session.clone();
                        let call = hangup_call.clone();
                        tokio::spawn(async move {
                            session.remove_peer_call(call, reason).await;
                        });
                        return;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }));

        let mut replaced_rx = events.replaced;
        let session = self.clone();
        let replaced_call = call.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match replaced_rx.recv().await {
                    Ok(replacement) => {
                        // The swap aborts this forwarder; run it detached.
                        let session = session.clone();
                        let existing = replaced_call.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session.on_peer_replaced(existing, replacement).await {
                                warn!("Peer-initiated call replacement failed: {e}");
                            }
                        });
                        return;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }));

        let mut added_rx = events.stream_added;
        let session = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match added_rx.recv().await {
                    Ok(stream) => {
                        if !stream.is_local() {
                            session.streams.write().await.add(&session.events, stream);
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }));

        let mut removed_rx = events.stream_removed;
        let session = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match removed_rx.recv().await {
                    Ok(stream) => {
                        if stream.is_local() {
                            continue;
                        }
                        let participant = stream.participant().clone();
                        let mut streams = session.streams.write().await;
                        streams.remove(&session.events, stream.purpose(), &participant);
                        let fallback = streams
                            .user_media_streams()
                            .first()
                            .map(|s| s.participant().clone());
                        session
                            .speaker
                            .lock()
                            .await
                            .remove_participant(&participant, fallback);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }));

        let mut feeds_rx = events.feeds_changed;
        let session = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match feeds_rx.recv().await {
                    Ok(()) => {
                        let _ = session.events.feeds_changed.send(());
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        }));

        handles
    }

    /// Glare handling: the transport decided the call is superseded by a
    /// replacement call. Swap it in and answer with our streams.
    async fn on_peer_replaced(
        self: &Arc<Self>,
        existing: Arc<dyn MediaTransport>,
        replacement: Arc<dyn MediaTransport>,
    ) -> Result<(), GroupCallError> {
        self.replace_peer_call(existing, replacement.clone()).await?;
        let local_streams = self.streams.read().await.local_streams();
        replacement.answer_with_streams(local_streams).await?;
        Ok(())
    }

    // ==================== Local media controls ====================

    /// Starts or stops the local screenshare, propagating the stream to
    /// every peer call. Acquisition failures surface on the error stream
    /// and report `false`; they do not change session state.
    pub async fn set_screensharing_enabled(&self, enabled: bool) -> Result<bool, GroupCallError> {
        let currently = self.is_screensharing().await;
        if enabled == currently {
            return Ok(currently);
        }

        if enabled {
            let raw = match self.media_devices.get_display_media().await {
                Ok(raw) => raw,
                Err(e) => {
                    let err = GroupCallError::Screenshare(e);
                    warn!("Display media acquisition failed: {err}");
                    self.events.emit_error(err.to_string());
                    return Ok(false);
                }
            };
            let stream = WrappedMediaStream::new(
                self.local.clone(),
                StreamPurpose::Screenshare,
                true,
                raw,
            );
            self.streams.write().await.add(&self.events, stream.clone());
            for call in self.peers.read().await.calls() {
                if let Err(e) = call.add_local_stream(stream.clone()).await {
                    warn!("Failed to add screenshare to call {}: {e}", call.call_id());
                }
            }
            self.events.emit(GroupCallEvent::LocalScreenshareStateChanged);
            Ok(true)
        } else {
            let existing = self
                .streams
                .read()
                .await
                .get(StreamPurpose::Screenshare, &self.local)
                .cloned();
            if let Some(stream) = existing {
                for call in self.peers.read().await.calls() {
                    if let Err(e) = call.remove_local_stream(&stream).await {
                        warn!(
                            "Failed to remove screenshare from call {}: {e}",
                            call.call_id()
                        );
                    }
                }
                self.streams
                    .write()
                    .await
                    .remove(&self.events, StreamPurpose::Screenshare, &self.local);
            }
            self.events.emit(GroupCallEvent::LocalScreenshareStateChanged);
            Ok(false)
        }
    }

    pub async fn set_microphone_muted(&self, muted: bool) {
        if let Some(stream) = self.local_user_media_stream().await {
            stream.set_audio_muted(muted);
        }
        for call in self.peers.read().await.calls() {
            call.set_microphone_muted(muted).await;
        }
        self.events.emit(GroupCallEvent::LocalMuteStateChanged);
    }

    pub async fn set_local_video_muted(&self, muted: bool) {
        if let Some(stream) = self.local_user_media_stream().await {
            stream.set_video_muted(muted);
        }
        for call in self.peers.read().await.calls() {
            call.set_local_video_muted(muted).await;
        }
        self.events.emit(GroupCallEvent::LocalMuteStateChanged);
    }

    /// Fans a media-device change out to every peer call.
    pub async fn update_media_device_for_calls(&self) {
        for call in self.peers.read().await.calls() {
            call.update_media_device().await;
        }
    }

    // ==================== Membership heartbeat ====================

    /// Rewrites the local user's member event: our stale entry for this
    /// call and device is stripped and, when `include_self`, replaced by a
    /// fresh one with a bumped expiry.
    async fn write_member_state(&self, include_self: bool) -> Result<(), ServiceError> {
        let now = Utc::now().timestamp_millis();
        let events = self.room.call_member_events(&self.id.room_id).await?;
        let mut memberships: Vec<Value> = events
            .iter()
            .find(|e| e.sender == self.local.user_id)
            .map(|e| memberships_array(&e.content))
            .unwrap_or_default();

        let device_id = self.local.device_id.clone().unwrap_or_default();
        memberships.retain(|raw| {
            match parse_membership(&self.local.user_id, &self.id.room_id, raw) {
                Some(m) => {
                    !(m.call_id == self.id.call_id
                        && m.device_id == device_id
                        && m.application == self.application
                        && m.scope == self.scope)
                }
                // Entries we cannot read are left untouched.
                None => true,
            }
        });

        if include_self {
            let fresh = CallMembership {
                user_id: self.local.user_id.clone(),
                room_id: self.id.room_id.clone(),
                call_id: self.id.call_id.clone(),
                device_id,
                application: self.application.clone(),
                scope: self.scope.clone(),
                backend: self.backend.clone(),
                membership_id: self.membership_id.clone(),
                expires_ts: now + self.config.expire_ts_bump.as_millis() as i64,
            };
            memberships.push(fresh.to_wire());
        }

        self.room
            .set_call_member_event(
                &self.id.room_id,
                &self.local.user_id,
                json!({ "memberships": memberships }),
            )
            .await
    }

    /// Publishes (or refreshes) our membership entry.
    pub async fn send_member_state_event(&self) -> Result<(), GroupCallError> {
        self.write_member_state(true).await?;
        Ok(())
    }

    /// Strips our membership entry from the room state.
    pub async fn remove_member_state_event(&self) -> Result<(), GroupCallError> {
        self.write_member_state(false).await?;
        Ok(())
    }

    /// Periodic membership refresh; runs while the session is live and
    /// removes the membership once it is not.
    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = sleep(self.config.update_expire_ts_interval) => {
                    let state = self.state().await;
                    if matches!(
                        state,
                        GroupCallState::Ended | GroupCallState::LocalFeedUninitialized
                    ) {
                        if let Err(e) = self.remove_member_state_event().await {
                            warn!(target: "GroupCall/Heartbeat", "Failed to remove membership: {e}");
                        }
                        return;
                    }
                    if let Err(e) = self.send_member_state_event().await {
                        warn!(target: "GroupCall/Heartbeat", "Failed to refresh membership: {e}");
                    }
                }
                _ = self.shutdown.notified() => {
                    debug!(target: "GroupCall/Heartbeat", "Shutdown signaled, exiting heartbeat loop.");
                    return;
                }
            }
        }
    }

    // ==================== Active speaker ====================

    async fn active_speaker_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = sleep(self.config.active_speaker_interval) => {
                    self.poll_audio_levels().await;
                }
                _ = self.shutdown.notified() => {
                    debug!(target: "GroupCall/Speaker", "Shutdown signaled, exiting speaker loop.");
                    return;
                }
            }
        }
    }

    async fn poll_audio_levels(&self) {
        let user_media: Vec<WrappedMediaStream> = self
            .streams
            .read()
            .await
            .user_media_streams()
            .to_vec();

        let mut local_sampled = false;
        for stream in user_media.iter().filter(|s| !s.is_local()) {
            let participant = stream.participant().clone();
            let Some(call) = self.peers.read().await.get_for_participant(&participant) else {
                continue;
            };
            let stats = match call.get_stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!("Stats read failed for call {}: {e}", call.call_id());
                    continue;
                }
            };

            if let Some(level) = stats
                .iter()
                .find(|r| r.report_type == "inbound-rtp" && r.kind == "audio")
                .and_then(|r| r.audio_level)
            {
                self.speaker.lock().await.update_level(participant, level);
            }
            if !local_sampled
                && let Some(level) = stats
                    .iter()
                    .find(|r| r.report_type == "media-source" && r.kind == "audio")
                    .and_then(|r| r.audio_level)
            {
                self.speaker
                    .lock()
                    .await
                    .update_level(self.local.clone(), level);
                local_sampled = true;
            }
        }

        if let Some(new_active) = self.speaker.lock().await.recompute() {
            let _ = self.events.active_speaker_changed.send(new_active);
            self.events.emit(GroupCallEvent::ActiveSpeakerChanged);
        }
    }

    // ==================== E2EE key ladder ====================

    /// Generates a fresh sender key in the next index slot and distributes
    /// it to the other participants.
    pub async fn make_new_sender_key(
        self: &Arc<Self>,
        delay_before_use: bool,
    ) -> Result<(), GroupCallError> {
        let key = SenderKey::generate();
        let index = self.keys.lock().await.allocate_index();
        self.set_encryption_key(self.local.clone(), index, key, delay_before_use, true, None)
            .await
    }

    /// Records a key, optionally distributes it, and installs it into the
    /// media encryptor, either immediately or after the use-key delay.
    ///
    /// `latest_local_index` advances as soon as a local key is recorded;
    /// `current_local_index` only once the (possibly deferred) install ran.
    pub async fn set_encryption_key(
        self: &Arc<Self>,
        participant: Participant,
        index: u8,
        key: SenderKey,
        delay_before_use: bool,
        send: bool,
        send_to: Option<Vec<Participant>>,
    ) -> Result<(), GroupCallError> {
        let is_local = participant == self.local;
        {
            let mut keys = self.keys.lock().await;
            keys.insert(&participant, index, key.clone());
            if is_local {
                keys.set_latest_local_index(index);
            }
        }

        if send {
            self.send_encryption_keys_event(index, send_to).await?;
        }

        if is_local && delay_before_use {
            let session = self.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(session.config.use_key_delay) => {
                        session
                            .key_provider
                            .on_set_encryption_key(&session.local, key.as_bytes(), index)
                            .await;
                        session.keys.lock().await.set_current_local_index(index);
                    }
                    _ = session.shutdown.notified() => {}
                }
            });
            let mut installs = self.pending_installs.lock().await;
            installs.retain(|h| !h.is_finished());
            installs.push(handle);
        } else {
            self.key_provider
                .on_set_encryption_key(&participant, key.as_bytes(), index)
                .await;
            if is_local {
                self.keys.lock().await.set_current_local_index(index);
            }
        }
        Ok(())
    }

    /// Awaits every outstanding deferred key install.
    pub async fn wait_for_pending_key_installs(&self) {
        let handles: Vec<JoinHandle<()>> = self.pending_installs.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Distributes the local key at `index` over the device channel.
    ///
    /// Sends go to `send_to` when given, otherwise to every current remote
    /// participant. Each send is retried a bounded number of times.
    pub async fn send_encryption_keys_event(
        &self,
        index: u8,
        send_to: Option<Vec<Participant>>,
    ) -> Result<(), GroupCallError> {
        let key_b64 = match self.keys.lock().await.get(&self.local, index) {
            Some(key) => key.to_base64(),
            None => {
                warn!("No local key at index {index} to send");
                return Ok(());
            }
        };

        let recipients: Vec<Participant> = match send_to {
            Some(to) => to,
            None => self
                .participants
                .read()
                .await
                .iter()
                .filter(|p| **p != self.local)
                .cloned()
                .collect(),
        };
        if recipients.is_empty() {
            return Ok(());
        }

        let content = EncryptionKeysEventContent {
            keys: vec![EncryptionKeyEntry {
                index,
                key: key_b64,
            }],
            call_id: self.id.call_id.clone(),
            conf_id: self.id.call_id.clone(),
            device_id: self.local.device_id.clone().unwrap_or_default(),
            room_id: self.id.room_id.clone(),
        };
        let payload = serde_json::to_value(&content)
            .map_err(|e| GroupCallError::MalformedEvent(e.to_string()))?;

        let mut first_failure = None;
        for recipient in recipients {
            let Some(device_id) = recipient.device_id.clone().filter(|d| !d.is_empty()) else {
                warn!(
                    "Skipping key send to {} without a device id",
                    recipient.user_id
                );
                continue;
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self
                    .messenger
                    .send_to_device(
                        &recipient.user_id,
                        &device_id,
                        ENCRYPTION_KEYS_EVENT_TYPE,
                        payload.clone(),
                    )
                    .await
                {
                    Ok(()) => break,
                    Err(e) if attempt < SEND_KEY_ATTEMPTS => {
                        warn!(
                            "Key send to {}:{device_id} failed (attempt {attempt}): {e}",
                            recipient.user_id
                        );
                    }
                    Err(e) => {
                        self.events.emit_error(format!(
                            "key delivery to {}:{device_id} failed: {e}",
                            recipient.user_id
                        ));
                        if first_failure.is_none() {
                            first_failure = Some(GroupCallError::KeyDelivery {
                                user_id: recipient.user_id.clone(),
                                device_id,
                                attempts: attempt,
                                reason: e.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Advances the local key at its latest index by one deterministic
    /// ratchet step and distributes the result without install delay (the
    /// recipients derive the same step themselves).
    pub async fn ratchet_local_participant_key(
        self: &Arc<Self>,
        send_to: Option<Vec<Participant>>,
    ) -> Result<(), GroupCallError> {
        let index = {
            let keys = self.keys.lock().await;
            let index = keys.latest_local_index();
            if keys.get(&self.local, index).is_none() {
                None
            } else {
                Some(index)
            }
        };
        let Some(index) = index else {
            // Nothing to ratchet yet; start the ladder instead.
            return self.make_new_sender_key(false).await;
        };

        let mut ratcheted = Vec::new();
        for attempt in 1..=RATCHET_ATTEMPTS {
            ratcheted = self.key_provider.on_ratchet_key(&self.local, index).await;
            if !ratcheted.is_empty() {
                break;
            }
            warn!("Key ratchet returned empty bytes (attempt {attempt})");
        }
        if ratcheted.is_empty() {
            return Err(GroupCallError::RatchetFailed(RATCHET_ATTEMPTS));
        }
        let key = SenderKey::from_bytes(&ratcheted).ok_or_else(|| {
            GroupCallError::MalformedEvent("ratcheted key is not 32 bytes".to_string())
        })?;

        self.set_encryption_key(self.local.clone(), index, key, false, true, send_to)
            .await
    }

    /// Schedules a post-leave key rotation; overlapping calls inside the
    /// debounce window coalesce into one rotation.
    async fn debounce_new_sender_key(self: &Arc<Self>) {
        let mut guard = self.rotation_debounce.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let session = self.clone();
        *guard = Some(tokio::spawn(async move {
            tokio::select! {
                _ = sleep(session.config.make_key_delay) => {
                    if let Err(e) = session.make_new_sender_key(true).await {
                        warn!("Key rotation after participant leave failed: {e}");
                    }
                }
                _ = session.shutdown.notified() => {}
            }
        }));
    }

    /// Inbound sender keys from another device. Malformed payloads are
    /// logged and dropped.
    pub async fn on_call_encryption(
        self: &Arc<Self>,
        sender_user_id: &str,
        sender_device_id: &str,
        content: &Value,
    ) -> Result<(), GroupCallError> {
        let parsed: EncryptionKeysEventContent = match serde_json::from_value(content.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping malformed encryption keys event from {sender_user_id}: {e}");
                return Ok(());
            }
        };
        if parsed.room_id != self.id.room_id || parsed.conf_id != self.id.call_id {
            warn!(
                "Dropping encryption keys event for foreign call {}:{}",
                parsed.room_id, parsed.conf_id
            );
            return Ok(());
        }
        if parsed.keys.is_empty() {
            warn!("Ignoring encryption keys event with no keys from {sender_user_id}");
            return Ok(());
        }

        let sender = Participant::new(sender_user_id, Some(sender_device_id.to_string()));
        for entry in parsed.keys {
            if u64::from(entry.index) >= crate::e2ee::KEY_INDEX_SLOTS {
                warn!("Dropping key with out-of-range index {}", entry.index);
                continue;
            }
            let Some(key) = SenderKey::from_base64(&entry.key) else {
                warn!("Dropping undecodable key at index {}", entry.index);
                continue;
            };
            self.set_encryption_key(sender.clone(), entry.index, key, false, false, None)
                .await?;
        }
        Ok(())
    }

    /// Inbound request to resend our sender key. Honored only when the
    /// requesting device holds a live membership of this call.
    pub async fn on_call_encryption_key_request(
        self: &Arc<Self>,
        sender_user_id: &str,
        sender_device_id: &str,
        content: &Value,
    ) -> Result<(), GroupCallError> {
        let parsed: EncryptionKeysRequestContent = match serde_json::from_value(content.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Dropping malformed key request from {sender_user_id}: {e}");
                return Ok(());
            }
        };
        if parsed.room_id != self.id.room_id || parsed.conf_id != self.id.call_id {
            warn!(
                "Dropping key request scoped to foreign call {}:{}",
                parsed.room_id, parsed.conf_id
            );
            return Ok(());
        }

        let memberships = self
            .view
            .current(&self.id.call_id, &self.application, &self.scope)
            .await?;
        let is_member = memberships.iter().any(|m| {
            m.user_id == sender_user_id
                && m.device_id == sender_device_id
                && m.backend.same_kind(&self.backend)
        });
        if !is_member {
            warn!(
                "Ignoring key request from {sender_user_id}:{sender_device_id} without live membership"
            );
            return Ok(());
        }

        let index = self.keys.lock().await.latest_local_index();
        info!("Resending sender key at index {index} to {sender_user_id}:{sender_device_id}");
        self.send_encryption_keys_event(
            index,
            Some(vec![Participant::new(
                sender_user_id,
                Some(sender_device_id.to_string()),
            )]),
        )
        .await
    }
}
