//! Gemeinsame Fakes für die Integrationstests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pulse_call::call_engine::{
    AudioCodec, AudioFrame, CodecCapability, CodecError, CodecParams, EncodedPacket,
    FrameDecoder, FrameEncoder, InboundTrack, MediaTransport, TransportError, TransportEvent,
    TransportFactory,
};
use pulse_call::config::CallConfig;
use pulse_call::signaling::{
    CandidateDescriptor, SignalingChannel, SignalingError, SignalingMessage,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

pub const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// FAKES
// ============================================================================

pub struct FakeTransport {
    pub events: broadcast::Sender<TransportEvent>,
    pub writes: Mutex<Vec<(Bytes, Duration)>>,
    pub answered_offers: Mutex<Vec<String>>,
    pub remote_answers: Mutex<Vec<String>>,
    pub remote_candidates: Mutex<Vec<CandidateDescriptor>>,
    pub closed: AtomicBool,
    pub fail_offer: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(100);
        Arc::new(Self {
            events,
            writes: Mutex::new(Vec::new()),
            answered_offers: Mutex::new(Vec::new()),
            remote_answers: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_offer: AtomicBool::new(false),
        })
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(TransportError::WebRTC("no audio codec".to_string()));
        }
        Ok("v=0 fake-offer".to_string())
    }

    async fn create_answer(&self, offer_sdp: &str) -> Result<String, TransportError> {
        self.answered_offers.lock().push(offer_sdp.to_string());
        Ok("v=0 fake-answer".to_string())
    }

    async fn set_remote_answer(&self, answer_sdp: &str) -> Result<(), TransportError> {
        self.remote_answers.lock().push(answer_sdp.to_string());
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: &CandidateDescriptor,
    ) -> Result<(), TransportError> {
        self.remote_candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), TransportError> {
        self.writes.lock().push((data, duration));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSignaling {
    pub sent: Mutex<Vec<SignalingMessage>>,
    pub fail: AtomicBool,
    /// Hält den nächsten Send an, bis der Sender freigibt
    pub gate: Mutex<Option<oneshot::Receiver<()>>>,
    pub held: AtomicBool,
}

impl RecordingSignaling {
    /// Der nächste Send wartet auf das zurückgegebene Signal
    pub fn hold_next_send(&self) -> oneshot::Sender<()> {
        let (release, gate) = oneshot::channel();
        *self.gate.lock() = Some(gate);
        self.held.store(false, Ordering::SeqCst);
        release
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.event_type() == event_type)
            .count()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            self.held.store(true, Ordering::SeqCst);
            let _ = gate.await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::Http {
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

/// Unkomprimiertes PCM (little-endian)
#[derive(Debug, Default)]
pub struct PcmCodec {
    /// Optionales Gate: Encoder meldet Start und wartet auf Freigabe
    pub gate: Mutex<Option<(std::sync::mpsc::Sender<()>, std::sync::mpsc::Receiver<()>)>>,
}

pub struct PcmEncoder {
    gate: Option<(std::sync::mpsc::Sender<()>, std::sync::mpsc::Receiver<()>)>,
}

pub struct PcmDecoder;

impl FrameEncoder for PcmEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        if let Some((started, release)) = &self.gate {
            let _ = started.send(());
            let _ = release.recv();
        }
        Ok(AudioFrame::new(pcm.to_vec()).to_le_bytes().into())
    }
}

impl FrameDecoder for PcmDecoder {
    fn decode(&mut self, payload: &[u8], _frame_size: usize) -> Result<Vec<i16>, CodecError> {
        AudioFrame::from_le_bytes(payload)
            .map(AudioFrame::into_samples)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl AudioCodec for PcmCodec {
    fn capability(&self, params: &CodecParams) -> CodecCapability {
        CodecCapability {
            mime_type: "audio/L16".to_string(),
            clock_rate: params.sample_rate,
            channels: params.channels,
        }
    }

    fn encoder(&self, _: &CodecParams) -> Result<Box<dyn FrameEncoder>, CodecError> {
        Ok(Box::new(PcmEncoder {
            gate: self.gate.lock().take(),
        }))
    }

    fn decoder(&self, _: &CodecParams) -> Result<Box<dyn FrameDecoder>, CodecError> {
        Ok(Box::new(PcmDecoder))
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    pub packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<EncodedPacket>>,
}

impl FakeTrack {
    pub fn new(packets: mpsc::UnboundedReceiver<EncodedPacket>) -> Arc<Self> {
        Arc::new(Self {
            packets: tokio::sync::Mutex::new(packets),
        })
    }
}

#[async_trait]
impl InboundTrack for FakeTrack {
    async fn read_packet(&self) -> Result<Option<EncodedPacket>, TransportError> {
        Ok(self.packets.lock().await.recv().await)
    }
}

/// Merkt sich alle erzeugten Transports
#[derive(Default)]
pub struct FakeTransportFactory {
    pub created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _config: &CallConfig,
        _capability: &CodecCapability,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        let transport = FakeTransport::new();
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
