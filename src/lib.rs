//! Pulse Call - Matrix-signalisierte P2P Voice Calls
//!
//! Zwei-Parteien Sprachanrufe mit:
//! - Matrix Homeserver als Signaling-Kanal (`m.call.*` Room Events)
//! - WebRTC für P2P Audio-Kommunikation
//! - Opus Codec (Feature `opus`) und cpal Audio Devices (Feature `device-audio`)
//!
//! Einstiegspunkt ist der [`VoiceClient`].

pub mod call_engine;
pub mod config;
pub mod signaling;

use call_engine::{
    AudioCodec, AudioFrame, CallError, CallEvent, CallSession, CallState, CodecParams,
    EnqueueOutcome, PcmChunker, TransportFactory,
};
use config::ClientConfig;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use signaling::{
    CandidateDescriptor, SignalingChannel, SignalingClient, SignalingEvent, SignalingMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

// ============================================================================
// LOGGING
// ============================================================================

static TRACING: OnceCell<()> = OnceCell::new();

/// Installiert den tracing Subscriber (mehrfacher Aufruf ist harmlos)
///
/// `RUST_LOG` überschreibt die Default-Direktiven.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulse_call=debug,webrtc=warn"));

        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already installed");
        }
    });
}

// ============================================================================
// VOICE CLIENT
// ============================================================================

struct ClientInner {
    config: ClientConfig,
    signaling: Arc<SignalingClient>,
    codec: Arc<dyn AudioCodec>,
    transports: Arc<dyn TransportFactory>,
    party_id: String,
    session: RwLock<Option<CallSession>>,
    /// Serialisiert das Anlegen von Sessions (ausgehend und eingehend)
    session_guard: tokio::sync::Mutex<()>,
    session_created: Notify,
    shut_down: AtomicBool,
    chunker: Mutex<PcmChunker>,
    event_tx: broadcast::Sender<CallEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Eingeloggter Client mit höchstens einem aktiven Anruf
#[derive(Clone)]
pub struct VoiceClient {
    inner: Arc<ClientInner>,
}

impl VoiceClient {
    /// Loggt sich ein und startet Sync-Loop und Event-Dispatcher
    pub async fn connect(
        config: ClientConfig,
        codec: Arc<dyn AudioCodec>,
        transports: Arc<dyn TransportFactory>,
    ) -> Result<Self, CallError> {
        config.validate()?;

        let signaling = Arc::new(SignalingClient::login(config.signaling.clone()).await?);
        let party_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            "Connected as {} (party_id: {})",
            signaling.user_id(),
            party_id
        );

        let (event_tx, _) = broadcast::channel(100);
        let frame_size = config.call.frame_size();

        let inner = Arc::new(ClientInner {
            config,
            signaling: Arc::clone(&signaling),
            codec,
            transports,
            party_id,
            session: RwLock::new(None),
            session_guard: tokio::sync::Mutex::new(()),
            session_created: Notify::new(),
            shut_down: AtomicBool::new(false),
            chunker: Mutex::new(PcmChunker::new(frame_size)),
            event_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // Vor dem Sync abonnieren, damit keine Nachricht verloren geht
        let signaling_rx = signaling.subscribe();
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&inner), signaling_rx));
        let sync = signaling.start_sync();
        inner.tasks.lock().extend([dispatcher, sync]);

        Ok(Self { inner })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn user_id(&self) -> &str {
        self.inner.signaling.user_id()
    }

    pub fn access_token(&self) -> &str {
        self.inner.signaling.access_token()
    }

    /// Stabile Party-ID dieses Clients
    pub fn party_id(&self) -> &str {
        &self.inner.party_id
    }

    pub fn current_call_id(&self) -> Option<String> {
        self.inner.session.read().as_ref().and_then(|s| s.call_id())
    }

    /// Status des aktuellen Anrufs (`Idle` ohne Session)
    pub fn call_state(&self) -> CallState {
        self.inner
            .session
            .read()
            .as_ref()
            .map_or(CallState::Idle, |s| s.state())
    }

    /// Startet einen ausgehenden Anruf und gibt die Call-ID zurück
    ///
    /// Eine noch unbenutzte (`Idle`) Session wird übernommen.
    pub async fn start_call(&self) -> Result<String, CallError> {
        // Bis zum gesendeten Invite kann kein eingehender Call eine Session anlegen
        let _guard = self.inner.session_guard.lock().await;

        let session = match self.inner.active_session() {
            Some(session) if session.state() == CallState::Idle => session,
            Some(session) => {
                return Err(CallError::InvalidState {
                    expected: "Idle",
                    actual: session.state(),
                })
            }
            None => self.inner.new_session().await?,
        };
        session.start_call().await
    }

    /// Nimmt den eingehenden Anruf an
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let session = self.inner.active_session().ok_or(CallError::NoActiveCall)?;
        session.accept().await
    }

    /// Legt den aktuellen Anruf auf
    pub async fn hangup(&self) -> Result<(), CallError> {
        let session = self.inner.active_session().ok_or(CallError::NoActiveCall)?;
        session.hangup(None).await
    }

    /// Sendet ein Answer; eine leere `call_id` steht für den aktuellen Call
    pub async fn send_answer(&self, sdp: String, call_id: &str) -> Result<(), CallError> {
        match self.inner.active_session() {
            Some(session) => session.send_answer(sdp, call_id).await,
            None => {
                let message = SignalingMessage::answer(call_id, &self.inner.party_id, sdp);
                Ok(self.inner.signaling.send(&message).await?)
            }
        }
    }

    /// Sendet Candidates; eine leere `call_id` steht für den aktuellen Call
    pub async fn send_candidates(
        &self,
        candidates: Vec<CandidateDescriptor>,
        call_id: &str,
    ) -> Result<(), CallError> {
        match self.inner.active_session() {
            Some(session) => session.send_candidates(candidates, call_id).await,
            None => {
                let message =
                    SignalingMessage::candidates(call_id, &self.inner.party_id, candidates);
                Ok(self.inner.signaling.send(&message).await?)
            }
        }
    }

    /// Nimmt Little-Endian i16 PCM beliebiger Länge an
    ///
    /// Gibt die Anzahl der angenommenen 20ms Frames zurück; Reste werden
    /// bis zum nächsten Aufruf gepuffert.
    pub fn enqueue_outgoing_audio(&self, pcm: &[u8]) -> Result<usize, CallError> {
        let session = self.inner.active_session().ok_or(CallError::NoActiveCall)?;
        let state = session.state();
        if state != CallState::Connected {
            return Err(CallError::InvalidState {
                expected: "Connected",
                actual: state,
            });
        }

        let frames = self.inner.chunker.lock().push(pcm);
        let accepted = frames
            .into_iter()
            .map(|frame| session.enqueue_outgoing(frame))
            .filter(|outcome| *outcome == EnqueueOutcome::Queued)
            .count();
        Ok(accepted)
    }

    /// Wartet auf den nächsten empfangenen Frame als Little-Endian i16 PCM
    ///
    /// Gab es noch keinen Anruf, wird auf den ersten gewartet. `None`, sobald
    /// der aktuelle Anruf beendet ist oder der Client heruntergefahren wurde.
    pub async fn dequeue_incoming_audio(&self) -> Option<Vec<u8>> {
        self.dequeue_incoming_frame()
            .await
            .map(|frame| frame.to_le_bytes())
    }

    /// Wie [`Self::dequeue_incoming_audio`], aber als Frame
    pub async fn dequeue_incoming_frame(&self) -> Option<AudioFrame> {
        let session = self.inner.wait_for_session().await?;
        session.dequeue_incoming().await
    }

    /// Legt einen aktiven Anruf auf und stoppt Sync-Loop und Dispatcher
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.inner.session_created.notify_waiters();

        if let Some(session) = self.inner.active_session() {
            if let Err(e) = session.hangup(Some("user_hangup".to_string())).await {
                tracing::warn!("Hangup during shutdown failed: {}", e);
            }
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("VoiceClient shut down");
    }
}

impl std::fmt::Debug for VoiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceClient")
            .field("signaling", &self.inner.signaling)
            .field("party_id", &self.inner.party_id)
            .field("call_state", &self.call_state())
            .finish()
    }
}

impl ClientInner {
    /// Aktuelle Session, solange sie nicht beendet ist
    fn active_session(&self) -> Option<CallSession> {
        self.session
            .read()
            .as_ref()
            .filter(|s| s.state() != CallState::Ended)
            .cloned()
    }

    /// Aktuelle Session; ohne Session wird auf die nächste gewartet
    async fn wait_for_session(&self) -> Option<CallSession> {
        loop {
            let created = self.session_created.notified();
            tokio::pin!(created);
            created.as_mut().enable();

            if self.shut_down.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(session) = self.session.read().clone() {
                return Some(session);
            }
            created.await;
        }
    }

    /// Erstellt eine neue Session samt Transport und ersetzt die alte
    async fn new_session(&self) -> Result<CallSession, CallError> {
        let params = CodecParams::from_config(&self.config.call);
        let capability = self.codec.capability(&params);
        let transport = self.transports.create(&self.config.call, &capability).await?;

        let signaling: Arc<dyn SignalingChannel> = self.signaling.clone();
        let session = CallSession::new(
            self.config.call.clone(),
            self.party_id.clone(),
            transport,
            signaling,
            Arc::clone(&self.codec),
        )?;

        // Session-Events an die Client-Abonnenten weiterreichen
        let mut session_rx = session.subscribe();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match session_rx.recv().await {
                    Ok(event) => {
                        let ended = event == CallEvent::StateChanged(CallState::Ended);
                        let _ = event_tx.send(event);
                        if ended {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {} call event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.chunker.lock() = PcmChunker::new(self.config.call.frame_size());
        *self.session.write() = Some(session.clone());
        self.session_created.notify_waiters();
        Ok(session)
    }

    /// Leitet eine empfangene Nachricht an die passende Session
    async fn route(&self, sender: &str, message: SignalingMessage) {
        let party_id = message.party_id();
        if party_id == self.party_id || (party_id.is_empty() && sender == self.signaling.user_id())
        {
            tracing::debug!("Ignoring echo of own {}", message.event_type());
            return;
        }

        if let SignalingMessage::Invite(invite) = &message {
            if invite.call_id.is_empty() {
                tracing::warn!("Ignoring invite without call_id from {}", sender);
                return;
            }
        }

        let _guard = self.session_guard.lock().await;
        let session = match (self.active_session(), &message) {
            (Some(session), _) => session,
            (None, SignalingMessage::Invite(_)) => match self.new_session().await {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!("Cannot create session for incoming call: {}", e);
                    return;
                }
            },
            (None, _) => {
                tracing::debug!(
                    "No active call, ignoring {} for {}",
                    message.event_type(),
                    message.call_id()
                );
                return;
            }
        };

        session.deliver(message).await;
    }
}

async fn run_dispatcher(
    inner: Arc<ClientInner>,
    mut signaling_rx: broadcast::Receiver<SignalingEvent>,
) {
    loop {
        match signaling_rx.recv().await {
            Ok(SignalingEvent::Message { sender, message }) => {
                inner.route(&sender, message).await;
            }
            Ok(SignalingEvent::Synced) => {
                tracing::info!("Listening for calls in {}", inner.signaling.room_id());
            }
            Ok(SignalingEvent::SyncFailed(e)) => {
                tracing::debug!("Dispatcher saw sync failure: {}", e);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Dispatcher lagged, dropped {} signaling event(s)", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("Signaling dispatcher stopped");
}
