//! Call Session State Machine
//!
//! Verknüpft Signaling-Nachrichten mit der Media-Negotiation und startet
//! die Audio-Pipelines sobald der Transport verbunden ist.
//!
//! Alle Callbacks (Signaling, Transport, Timer) landen als [`SessionEvent`]
//! in genau einem Channel und werden seriell abgearbeitet. Der State liegt
//! hinter einem einzigen Mutex, der nie über ein `.await` gehalten wird.

use super::audio::{AudioError, AudioFrame, EnqueueOutcome, FrameQueue};
use super::codec::{AudioCodec, CodecAdapter, CodecError, CodecParams};
use super::pipeline::{spawn_receive_worker, PipelineSnapshot, PipelineStats, SendPipeline};
use super::transport::{
    InboundTrack, MediaTransport, TransportError, TransportEvent, TransportState,
};
use crate::config::{CallConfig, ConfigError};
use crate::signaling::{
    AnswerContent, CandidateDescriptor, CandidatesContent, HangupContent, InviteContent,
    SignalingChannel, SignalingError, SignalingMessage,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Invalid call state: expected {expected}, was {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: CallState,
    },

    #[error("No active call")]
    NoActiveCall,

    #[error("Call ended")]
    Ended,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Lebenszyklus eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Offer wird erstellt und Invite gesendet
    Inviting,
    /// Invite gesendet, warte auf Answer
    AwaitingAnswer,
    /// Eingehender Anruf wartet auf Annahme
    InviteReceived,
    /// Answer gesendet
    AnswerSent,
    /// Beide Descriptions gesetzt, ICE läuft
    Negotiating,
    /// Anruf aktiv, Audio fließt
    Connected,
    /// Anruf beendet
    Ended,
}

impl CallState {
    /// Ab hier sind eigene ICE Candidates nicht mehr im SDP enthalten
    fn sends_trickle_candidates(&self) -> bool {
        matches!(
            self,
            Self::AwaitingAnswer | Self::AnswerSent | Self::Negotiating | Self::Connected
        )
    }

    /// Remote Candidates werden bis zur gesetzten Remote Description gepuffert
    fn buffers_remote_candidates(&self) -> bool {
        matches!(
            self,
            Self::Inviting
                | Self::AwaitingAnswer
                | Self::InviteReceived
                | Self::AnswerSent
                | Self::Negotiating
                | Self::Connected
        )
    }
}

/// Identität eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallIdentity {
    pub call_id: String,
    pub local_party_id: String,
    pub remote_party_id: Option<String>,
}

/// Events die von der Session ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    IncomingCall { call_id: String },
    Error(String),
}

/// Eingänge der State Machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Signaling(SignalingMessage),
    Transport(TransportEvent),
    InviteExpired,
    Stop,
}

/// Erzeugt eine global eindeutige Call-ID
pub fn new_call_id() -> String {
    format!(
        "call-{}-{}",
        Utc::now().timestamp(),
        uuid::Uuid::new_v4().simple()
    )
}

// ============================================================================
// SESSION INTERNALS
// ============================================================================

struct SessionCore {
    state: CallState,
    identity: CallIdentity,
    remote_offer: Option<String>,
    remote_description_applied: bool,
    pending_candidates: Vec<CandidateDescriptor>,
    early_answer: Option<AnswerContent>,
    transport_connected: bool,
    send_codec: Option<CodecAdapter>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    config: CallConfig,
    params: CodecParams,
    core: Mutex<SessionCore>,
    transport: Arc<dyn MediaTransport>,
    signaling: Arc<dyn SignalingChannel>,
    codec: Arc<dyn AudioCodec>,
    send: SendPipeline,
    output: Arc<FrameQueue>,
    stats: Arc<PipelineStats>,
    events_tx: mpsc::Sender<SessionEvent>,
    notify_tx: broadcast::Sender<CallEvent>,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein einzelner Anruf (ausgehend oder eingehend)
///
/// Muss innerhalb einer Tokio Runtime erstellt werden.
#[derive(Clone)]
pub struct CallSession {
    shared: Arc<Shared>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        local_party_id: String,
        transport: Arc<dyn MediaTransport>,
        signaling: Arc<dyn SignalingChannel>,
        codec: Arc<dyn AudioCodec>,
    ) -> Result<Self, CallError> {
        let params = CodecParams::from_config(&config);
        let send_codec = CodecAdapter::new(codec.as_ref(), params)?;

        let stats = Arc::new(PipelineStats::default());
        let send = SendPipeline::new(
            config.send_queue_capacity,
            Duration::from_millis(u64::from(config.frame_duration_ms)),
            Arc::clone(&stats),
        );
        let output = Arc::new(FrameQueue::new(config.receive_queue_capacity));

        let (events_tx, events_rx) = mpsc::channel(100);
        let (notify_tx, _) = broadcast::channel(100);

        // Vor dem ersten Offer abonnieren, damit kein Event verloren geht
        let mut transport_rx = transport.subscribe();

        let shared = Arc::new(Shared {
            config,
            params,
            core: Mutex::new(SessionCore {
                state: CallState::Idle,
                identity: CallIdentity {
                    call_id: String::new(),
                    local_party_id,
                    remote_party_id: None,
                },
                remote_offer: None,
                remote_description_applied: false,
                pending_candidates: Vec::new(),
                early_answer: None,
                transport_connected: false,
                send_codec: Some(send_codec),
                tasks: Vec::new(),
            }),
            transport,
            signaling,
            codec,
            send,
            output,
            stats,
            events_tx: events_tx.clone(),
            notify_tx,
        });

        // Transport-Callbacks in den Event-Channel umleiten
        let forwarder = tokio::spawn(async move {
            loop {
                match transport_rx.recv().await {
                    Ok(event) => {
                        if events_tx.send(SessionEvent::Transport(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {} transport event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        shared.core.lock().tasks.push(forwarder);

        tokio::spawn(run_event_loop(Arc::clone(&shared), events_rx));

        Ok(Self { shared })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.notify_tx.subscribe()
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn state(&self) -> CallState {
        self.shared.core.lock().state
    }

    pub fn identity(&self) -> CallIdentity {
        self.shared.core.lock().identity.clone()
    }

    /// Aktuelle Call-ID (falls schon vergeben)
    pub fn call_id(&self) -> Option<String> {
        let core = self.shared.core.lock();
        (!core.identity.call_id.is_empty()).then(|| core.identity.call_id.clone())
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.shared.stats.snapshot()
    }

    /// Reicht eine empfangene Signaling-Nachricht an die State Machine weiter
    pub async fn deliver(&self, message: SignalingMessage) {
        if self
            .shared
            .events_tx
            .send(SessionEvent::Signaling(message))
            .await
            .is_err()
        {
            tracing::debug!("Session event loop already stopped");
        }
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Gibt die neue Call-ID zurück, sobald das Invite gesendet wurde.
    pub async fn start_call(&self) -> Result<String, CallError> {
        self.shared.start_call().await
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn accept(&self) -> Result<(), CallError> {
        self.shared.accept().await
    }

    /// Sendet ein Answer; eine leere `call_id` steht für den aktuellen Call
    pub async fn send_answer(&self, sdp: String, call_id: &str) -> Result<(), CallError> {
        let message = {
            let core = self.shared.core.lock();
            let call_id = resolve_call_id(call_id, &core.identity);
            SignalingMessage::answer(&call_id, &core.identity.local_party_id, sdp)
        };
        self.shared.signaling.send(&message).await?;
        Ok(())
    }

    /// Sendet Candidates; eine leere `call_id` steht für den aktuellen Call
    pub async fn send_candidates(
        &self,
        candidates: Vec<CandidateDescriptor>,
        call_id: &str,
    ) -> Result<(), CallError> {
        let message = {
            let core = self.shared.core.lock();
            let call_id = resolve_call_id(call_id, &core.identity);
            SignalingMessage::candidates(&call_id, &core.identity.local_party_id, candidates)
        };
        self.shared.signaling.send(&message).await?;
        Ok(())
    }

    /// Legt auf (sendet Hangup, Fehler werden nur geloggt)
    pub async fn hangup(&self, reason: Option<String>) -> Result<(), CallError> {
        let (state, message) = {
            let core = self.shared.core.lock();
            let message = (!core.identity.call_id.is_empty()).then(|| {
                SignalingMessage::hangup(
                    &core.identity.call_id,
                    &core.identity.local_party_id,
                    reason.clone(),
                )
            });
            (core.state, message)
        };

        if state == CallState::Ended {
            return Err(CallError::NoActiveCall);
        }

        if let Some(message) = message {
            if let Err(e) = self.shared.signaling.send(&message).await {
                tracing::error!("Failed to send hangup: {}", e);
            }
        }

        self.shared.end("local hangup").await;
        Ok(())
    }

    /// Nicht-blockierend; nur im Zustand `Connected` werden Frames angenommen
    pub fn enqueue_outgoing(&self, frame: AudioFrame) -> EnqueueOutcome {
        self.shared.send.enqueue(frame)
    }

    /// Wartet auf den nächsten dekodierten Frame; `None` nach Call-Ende
    pub async fn dequeue_incoming(&self) -> Option<AudioFrame> {
        self.shared.output.pop().await
    }

    /// Blockierende Variante für Audio-Threads
    pub fn dequeue_incoming_blocking(&self) -> Option<AudioFrame> {
        self.shared.output.pop_blocking()
    }

    pub fn frame_size(&self) -> usize {
        self.shared.params.frame_size
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("CallSession")
            .field("state", &core.state)
            .field("identity", &core.identity)
            .finish()
    }
}

fn resolve_call_id(call_id: &str, identity: &CallIdentity) -> String {
    if call_id.is_empty() {
        identity.call_id.clone()
    } else {
        call_id.to_string()
    }
}

/// Nicht gesetzte (leere) Call-ID gilt als der aktuelle Call
fn call_id_matches(call_id: &str, identity: &CallIdentity) -> bool {
    call_id.is_empty() || call_id == identity.call_id
}

// ============================================================================
// EVENT LOOP
// ============================================================================

async fn run_event_loop(shared: Arc<Shared>, mut events_rx: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events_rx.recv().await {
        if matches!(event, SessionEvent::Stop) {
            break;
        }
        shared.handle_event(event).await;
        if shared.state() == CallState::Ended {
            break;
        }
    }
    tracing::debug!("Session event loop stopped");
}

impl Shared {
    fn state(&self) -> CallState {
        self.core.lock().state
    }

    fn notify(&self, event: CallEvent) {
        if let CallEvent::StateChanged(state) = &event {
            tracing::info!("Call state changed: {:?}", state);
        }
        let _ = self.notify_tx.send(event);
    }

    /// Übergang nur aus einem der erlaubten Zustände
    fn transition(&self, from: &[CallState], to: CallState) -> Result<(), CallError> {
        {
            let mut core = self.core.lock();
            if !from.contains(&core.state) {
                return Err(CallError::InvalidState {
                    expected: state_names(from),
                    actual: core.state,
                });
            }
            core.state = to;
        }
        self.notify(CallEvent::StateChanged(to));
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Signaling(SignalingMessage::Invite(invite)) => self.on_invite(invite),
            SessionEvent::Signaling(SignalingMessage::Answer(answer)) => {
                self.on_answer_received(answer).await
            }
            SessionEvent::Signaling(SignalingMessage::Candidates(candidates)) => {
                self.on_candidates_received(candidates).await
            }
            SessionEvent::Signaling(SignalingMessage::Hangup(hangup)) => {
                self.on_remote_hangup(hangup).await
            }
            SessionEvent::Transport(TransportEvent::LocalCandidate(candidate)) => {
                self.on_local_candidate(candidate)
            }
            SessionEvent::Transport(TransportEvent::StateChanged(state)) => {
                self.on_transport_state(state).await
            }
            SessionEvent::Transport(TransportEvent::IncomingTrack(track)) => {
                self.on_incoming_track(track)
            }
            SessionEvent::InviteExpired => self.on_invite_expired().await,
            SessionEvent::Stop => {}
        }
    }

    // ========================================================================
    // OUTGOING CALL
    // ========================================================================

    async fn start_call(self: &Arc<Self>) -> Result<String, CallError> {
        let (call_id, party_id) = {
            let mut core = self.core.lock();
            if core.state != CallState::Idle {
                return Err(CallError::InvalidState {
                    expected: "Idle",
                    actual: core.state,
                });
            }
            core.identity.call_id = new_call_id();
            core.state = CallState::Inviting;
            (
                core.identity.call_id.clone(),
                core.identity.local_party_id.clone(),
            )
        };
        self.notify(CallEvent::StateChanged(CallState::Inviting));
        tracing::info!("Starting call {}", call_id);

        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(format!("offer creation failed: {}", e)).await;
                return Err(e.into());
            }
        };

        let lifetime = self.config.invite_lifetime_ms;
        let invite = SignalingMessage::invite(&call_id, &party_id, lifetime, offer);
        if let Err(e) = self.signaling.send(&invite).await {
            self.fail(format!("invite failed: {}", e)).await;
            return Err(e.into());
        }

        // Während des Invites aufgelegt?
        self.transition(&[CallState::Inviting], CallState::AwaitingAnswer)
            .map_err(|_| CallError::Ended)?;

        self.spawn_invite_timer(lifetime);

        let early = self.core.lock().early_answer.take();
        if let Some(answer) = early {
            tracing::debug!("Replaying answer that arrived during invite");
            let _ = self
                .events_tx
                .send(SessionEvent::Signaling(SignalingMessage::Answer(answer)))
                .await;
        }

        Ok(call_id)
    }

    async fn on_answer_received(self: &Arc<Self>, answer: AnswerContent) {
        {
            let mut core = self.core.lock();
            if !call_id_matches(&answer.call_id, &core.identity) {
                tracing::warn!(
                    "Ignoring answer for call {} (current {})",
                    answer.call_id,
                    core.identity.call_id
                );
                return;
            }
            match core.state {
                CallState::AwaitingAnswer => {}
                CallState::Inviting => {
                    core.early_answer = Some(answer);
                    return;
                }
                state => {
                    tracing::debug!("Ignoring answer in state {:?}", state);
                    return;
                }
            }
            if !answer.party_id.is_empty() {
                core.identity.remote_party_id = Some(answer.party_id.clone());
            }
        }

        tracing::info!("Applying answer for call {}", self.current_call_id());
        if let Err(e) = self.transport.set_remote_answer(&answer.answer.sdp).await {
            self.fail(format!("failed to apply answer: {}", e)).await;
            return;
        }

        if self.enter_negotiating(CallState::AwaitingAnswer).is_err() {
            return;
        }
        self.flush_pending_candidates().await;
    }

    async fn on_invite_expired(self: &Arc<Self>) {
        match self.state() {
            CallState::AwaitingAnswer => {
                tracing::info!("Invite lifetime expired without answer");
                let message = {
                    let core = self.core.lock();
                    SignalingMessage::hangup(
                        &core.identity.call_id,
                        &core.identity.local_party_id,
                        Some("invite_timeout".to_string()),
                    )
                };
                if let Err(e) = self.signaling.send(&message).await {
                    tracing::error!("Failed to send hangup: {}", e);
                }
                self.end("invite timeout").await;
            }
            CallState::InviteReceived => {
                self.end("incoming invite expired").await;
            }
            _ => {}
        }
    }

    fn spawn_invite_timer(&self, lifetime_ms: u64) {
        let events_tx = self.events_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(lifetime_ms)).await;
            let _ = events_tx.send(SessionEvent::InviteExpired).await;
        });
        self.core.lock().tasks.push(timer);
    }

    // ========================================================================
    // INCOMING CALL
    // ========================================================================

    fn on_invite(&self, invite: InviteContent) {
        {
            let mut core = self.core.lock();
            if core.state != CallState::Idle {
                if invite.call_id == core.identity.call_id {
                    tracing::debug!("Ignoring duplicate invite for {}", invite.call_id);
                } else {
                    tracing::warn!(
                        "Ignoring invite {} while in state {:?}",
                        invite.call_id,
                        core.state
                    );
                }
                return;
            }
            if invite.call_id.is_empty() {
                tracing::warn!("Ignoring invite without call_id");
                return;
            }

            tracing::info!("Incoming call {}", invite.call_id);
            core.identity.call_id = invite.call_id.clone();
            if !invite.party_id.is_empty() {
                core.identity.remote_party_id = Some(invite.party_id.clone());
            }
            core.remote_offer = Some(invite.offer.sdp);
            core.state = CallState::InviteReceived;
        }
        self.notify(CallEvent::StateChanged(CallState::InviteReceived));
        self.notify(CallEvent::IncomingCall {
            call_id: invite.call_id,
        });
        self.spawn_invite_timer(invite.lifetime);
    }

    async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        let (offer, call_id, party_id) = {
            let core = self.core.lock();
            match (&core.state, &core.remote_offer) {
                (CallState::InviteReceived, Some(offer)) => (
                    offer.clone(),
                    core.identity.call_id.clone(),
                    core.identity.local_party_id.clone(),
                ),
                _ => {
                    return Err(CallError::InvalidState {
                        expected: "InviteReceived",
                        actual: core.state,
                    })
                }
            }
        };

        tracing::info!("Accepting call {}", call_id);
        let answer = match self.transport.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(format!("answer creation failed: {}", e)).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .signaling
            .send(&SignalingMessage::answer(&call_id, &party_id, answer))
            .await
        {
            self.fail(format!("answer send failed: {}", e)).await;
            return Err(e.into());
        }

        self.transition(&[CallState::InviteReceived], CallState::AnswerSent)
            .map_err(|_| CallError::Ended)?;
        self.enter_negotiating(CallState::AnswerSent)?;

        self.flush_pending_candidates().await;
        Ok(())
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    async fn on_candidates_received(self: &Arc<Self>, content: CandidatesContent) {
        let apply_now = {
            let mut core = self.core.lock();
            if !call_id_matches(&content.call_id, &core.identity) {
                if core.identity.remote_party_id.is_some() {
                    tracing::warn!("Ignoring candidates for call {}", content.call_id);
                    return;
                }
                tracing::warn!(
                    "Accepting candidates for call {} before remote party is known",
                    content.call_id
                );
            }

            match core.state {
                CallState::Negotiating | CallState::Connected if core.remote_description_applied => {
                    true
                }
                state if state.buffers_remote_candidates() => {
                    core.pending_candidates.extend(content.candidates.iter().cloned());
                    false
                }
                state => {
                    tracing::debug!("Ignoring candidates in state {:?}", state);
                    return;
                }
            }
        };

        if apply_now {
            self.apply_candidates(content.candidates).await;
        } else {
            tracing::debug!("Buffered {} remote candidate(s)", content.candidates.len());
        }
    }

    /// Wendet gepufferte Candidates an, sobald die Remote Description steht
    async fn flush_pending_candidates(self: &Arc<Self>) {
        let pending = {
            let mut core = self.core.lock();
            core.remote_description_applied = true;
            std::mem::take(&mut core.pending_candidates)
        };
        if !pending.is_empty() {
            self.apply_candidates(pending).await;
        }
    }

    async fn apply_candidates(self: &Arc<Self>, candidates: Vec<CandidateDescriptor>) {
        for candidate in candidates {
            // Leerer Candidate markiert das Ende des Gatherings der Gegenseite
            if candidate.candidate.is_empty() {
                tracing::debug!("Remote end-of-candidates");
                continue;
            }
            tracing::debug!("Adding remote candidate: {}", candidate.candidate);
            if let Err(e) = self.transport.add_remote_candidate(&candidate).await {
                self.fail(format!("failed to add remote candidate: {}", e))
                    .await;
                return;
            }
        }
    }

    fn on_local_candidate(&self, candidate: CandidateDescriptor) {
        let message = {
            let core = self.core.lock();
            if !core.state.sends_trickle_candidates() {
                tracing::debug!("Local candidate already part of the SDP");
                return;
            }
            SignalingMessage::candidates(
                &core.identity.call_id,
                &core.identity.local_party_id,
                vec![candidate],
            )
        };

        let signaling = Arc::clone(&self.signaling);
        tokio::spawn(async move {
            if let Err(e) = signaling.send(&message).await {
                tracing::error!("Failed to send ICE candidate: {}", e);
            }
        });
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    async fn on_transport_state(self: &Arc<Self>, state: TransportState) {
        if state.is_terminal() {
            self.fail(format!("transport {:?}", state)).await;
            return;
        }

        match state {
            TransportState::Connected => {
                {
                    let mut core = self.core.lock();
                    match core.state {
                        CallState::Negotiating => {}
                        // Answer wird noch gesendet; Übergang folgt in enter_negotiating
                        CallState::InviteReceived | CallState::AnswerSent => {
                            core.transport_connected = true;
                            return;
                        }
                        state => {
                            tracing::debug!("Transport connected in state {:?}", state);
                            return;
                        }
                    }
                }
                if self
                    .transition(&[CallState::Negotiating], CallState::Connected)
                    .is_ok()
                {
                    self.start_send_pipeline();
                }
            }
            TransportState::Disconnected => {
                tracing::warn!("Transport disconnected, waiting for ICE to recover");
            }
            _ => {
                tracing::debug!("Transport state {:?}", state);
            }
        }
    }

    /// Beide Descriptions stehen; war ICE schneller, direkt weiter zu `Connected`
    fn enter_negotiating(&self, from: CallState) -> Result<(), CallError> {
        self.transition(&[from], CallState::Negotiating)
            .map_err(|_| CallError::Ended)?;

        let connected = self.core.lock().transport_connected;
        if connected
            && self
                .transition(&[CallState::Negotiating], CallState::Connected)
                .is_ok()
        {
            self.start_send_pipeline();
        }
        Ok(())
    }

    fn start_send_pipeline(&self) {
        let codec = self.core.lock().send_codec.take();
        match codec {
            Some(codec) => {
                // Der Send-Worker beendet sich selbst, wenn die Queue schließt
                let _worker = self.send.start(codec, Arc::clone(&self.transport));
                tracing::info!("Audio send pipeline started");
            }
            None => tracing::warn!("Send pipeline already started"),
        }
    }

    fn on_incoming_track(&self, track: Arc<dyn InboundTrack>) {
        if self.state() == CallState::Ended {
            return;
        }

        let codec = match CodecAdapter::new(self.codec.as_ref(), self.params) {
            Ok(codec) => codec,
            Err(e) => {
                tracing::error!("Cannot decode inbound track: {}", e);
                return;
            }
        };

        let worker = spawn_receive_worker(
            track,
            codec,
            self.config.max_reassembly_depth,
            Arc::clone(&self.output),
            Arc::clone(&self.stats),
        );
        self.core.lock().tasks.push(worker);
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    async fn on_remote_hangup(self: &Arc<Self>, hangup: HangupContent) {
        {
            let core = self.core.lock();
            if matches!(core.state, CallState::Idle | CallState::Ended) {
                return;
            }
            if !call_id_matches(&hangup.call_id, &core.identity) {
                tracing::warn!("Ignoring hangup for call {}", hangup.call_id);
                return;
            }
        }
        tracing::info!(
            "Remote hangup (reason: {})",
            hangup.reason.as_deref().unwrap_or("none")
        );
        self.end("remote hangup").await;
    }

    async fn fail(self: &Arc<Self>, message: String) {
        tracing::error!("Call failed: {}", message);
        self.notify(CallEvent::Error(message.clone()));
        self.end(&message).await;
    }

    /// Beendet den Call: Queues schließen, Worker stoppen, Transport schließen
    async fn end(self: &Arc<Self>, reason: &str) {
        let (call_id, tasks) = {
            let mut core = self.core.lock();
            if core.state == CallState::Ended {
                return;
            }
            core.state = CallState::Ended;
            (
                core.identity.call_id.clone(),
                std::mem::take(&mut core.tasks),
            )
        };

        tracing::info!("Ending call {} ({})", call_id, reason);

        self.send.close();
        self.output.close();
        for task in tasks {
            task.abort();
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!("Failed to close transport: {}", e);
        }

        self.notify(CallEvent::StateChanged(CallState::Ended));
        let _ = self.events_tx.try_send(SessionEvent::Stop);
    }

    fn current_call_id(&self) -> String {
        self.core.lock().identity.call_id.clone()
    }
}

fn state_names(states: &[CallState]) -> &'static str {
    match states {
        [CallState::Idle] => "Idle",
        [CallState::Inviting] => "Inviting",
        [CallState::AwaitingAnswer] => "AwaitingAnswer",
        [CallState::InviteReceived] => "InviteReceived",
        [CallState::AnswerSent] => "AnswerSent",
        [CallState::Negotiating] => "Negotiating",
        _ => "one of several states",
    }
}

// ============================================================================
// TESTS
// ============================================================================
