//! Media Transport Schnittstelle
//!
//! Die Call-Session treibt den Transport nur über [`MediaTransport`].
//! [`WebRtcTransport`] implementiert die Schnittstelle mit webrtc-rs
//! (ICE, DTLS/SRTP und RTP liegen komplett dort).

use super::codec::CodecCapability;
use super::jitter::EncodedPacket;
use crate::config::{CallConfig, IceServerConfig};
use crate::signaling::CandidateDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No local description available")]
    NoLocalDescription,

    #[error("Transport closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        Self::WebRTC(e.to_string())
    }
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Verbindungsstatus des Transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Endgültige Zustände beenden den Call
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Eingehender Audio-Track
#[async_trait]
pub trait InboundTrack: Send + Sync + std::fmt::Debug {
    /// Nächstes Paket; `Ok(None)` bei Stream-Ende
    async fn read_packet(&self) -> Result<Option<EncodedPacket>, TransportError>;
}

/// Events die vom Transport ausgelöst werden
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(CandidateDescriptor),
    StateChanged(TransportState),
    IncomingTrack(Arc<dyn InboundTrack>),
}

// ============================================================================
// MEDIA TRANSPORT
// ============================================================================

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Erstellt das Offer, setzt es lokal und wartet bis ICE Gathering fertig ist
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Setzt das Remote-Offer und erstellt das Answer (inkl. Gathering)
    async fn create_answer(&self, offer_sdp: &str) -> Result<String, TransportError>;

    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(
        &self,
        candidate: &CandidateDescriptor,
    ) -> Result<(), TransportError>;

    /// Schreibt einen kodierten Frame auf den ausgehenden Track
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erstellt pro Call einen frischen Transport
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &CallConfig,
        capability: &CodecCapability,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}

// ============================================================================
// WEBRTC TRANSPORT
// ============================================================================

/// webrtc-rs Peer Connection mit genau einem ausgehenden Audio-Track
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticSample>,
    event_tx: broadcast::Sender<TransportEvent>,
}

impl WebRtcTransport {
    /// Erstellt die Peer Connection und fügt den Audio-Track hinzu
    pub async fn new(
        config: &CallConfig,
        capability: &CodecCapability,
    ) -> Result<Self, TransportError> {
        // Media Engine mit Standard-Codecs (inkl. Opus)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        let (event_tx, _) = broadcast::channel(100);

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: capability.mime_type.clone(),
                clock_rate: capability.clock_rate,
                channels: capability.channels,
                ..Default::default()
            },
            "audio".to_string(),
            "pulse-call".to_string(),
        ));

        let sender = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP lesen, damit die Interceptors arbeiten können
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let transport = Self {
            pc,
            audio_track,
            event_tx,
        };
        transport.setup_handlers();
        Ok(transport)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self) {
        // Connection State Handler
        let event_tx = self.event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        TransportState::New
                    }
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                };
                let _ = event_tx.send(TransportEvent::StateChanged(state));
                Box::pin(async {})
            }));

        // ICE Candidate Handler (None = Gathering abgeschlossen)
        let event_tx = self.event_tx.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = event_tx.send(TransportEvent::LocalCandidate(CandidateDescriptor {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (für eingehendes Audio)
        let event_tx = self.event_tx.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            if track.kind() == RTPCodecType::Audio {
                tracing::info!("Received audio track: {}", track.codec().capability.mime_type);
                let _ = event_tx.send(TransportEvent::IncomingTrack(Arc::new(WebRtcInboundTrack {
                    track,
                })));
            } else {
                tracing::debug!("Ignoring non-audio track");
            }
            Box::pin(async {})
        }));
    }

    /// Wartet auf das Ende des ICE Gatherings und liefert das lokale SDP
    async fn gathered_local_sdp(&self) -> Result<String, TransportError> {
        let mut done_rx = self.pc.gathering_complete_promise().await;
        let _ = done_rx.recv().await;

        self.pc
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or(TransportError::NoLocalDescription)
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.gathered_local_sdp().await
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;
        self.pc.set_remote_description(offer).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.gathered_local_sdp().await
    }

    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: &CandidateDescriptor,
    ) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TransportError> {
        self.audio_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("connection_state", &self.pc.connection_state())
            .finish()
    }
}

/// Erstellt [`WebRtcTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        config: &CallConfig,
        capability: &CodecCapability,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let transport = WebRtcTransport::new(config, capability).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// INBOUND TRACK
// ============================================================================

struct WebRtcInboundTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for WebRtcInboundTrack {
    async fn read_packet(&self) -> Result<Option<EncodedPacket>, TransportError> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Ok(Some(EncodedPacket {
                sequence: packet.header.sequence_number,
                timestamp: packet.header.timestamp,
                payload: packet.payload,
            })),
            // Lesefehler treten beim Schließen der Peer Connection auf
            Err(e) => {
                tracing::debug!("Track read ended: {}", e);
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for WebRtcInboundTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcInboundTrack")
            .field("ssrc", &self.track.ssrc())
            .finish()
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}
