//! Audio Send- und Receive-Pipelines
//!
//! Send:    FrameQueue → Encode → Transport-Track (20ms Samples)
//! Receive: Transport-Track → Jitter Reassembler → Decode → Output-Queue

use super::audio::{AudioFrame, EnqueueOutcome, FrameQueue};
use super::codec::CodecAdapter;
use super::jitter::JitterReassembler;
use super::transport::{InboundTrack, MediaTransport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// STATISTICS
// ============================================================================

/// Zähler für beide Richtungen (nur fürs Logging und Tests)
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub encode_failures: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub decode_failures: AtomicU64,
    pub playback_dropped: AtomicU64,
}

/// Momentaufnahme von [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub encode_failures: u64,
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub playback_dropped: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            playback_dropped: self.playback_dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// SEND PIPELINE
// ============================================================================

/// Ausgehende Richtung: nimmt Frames erst an, wenn der Call verbunden ist
pub struct SendPipeline {
    queue: Arc<FrameQueue>,
    active: AtomicBool,
    frame_duration: Duration,
    stats: Arc<PipelineStats>,
}

impl SendPipeline {
    pub fn new(capacity: usize, frame_duration: Duration, stats: Arc<PipelineStats>) -> Self {
        Self {
            queue: Arc::new(FrameQueue::new(capacity)),
            active: AtomicBool::new(false),
            frame_duration,
            stats,
        }
    }

    /// Nicht-blockierend; bei voller Queue wird der neue Frame verworfen
    pub fn enqueue(&self, frame: AudioFrame) -> EnqueueOutcome {
        if !self.active.load(Ordering::SeqCst) {
            return EnqueueOutcome::Rejected;
        }

        let outcome = self.queue.push(frame);
        if outcome == EnqueueOutcome::Dropped {
            PipelineStats::bump(&self.stats.frames_dropped);
            tracing::trace!("Send queue full, dropping newest frame");
        }
        outcome
    }

    /// Startet den Worker; danach werden Frames angenommen
    pub fn start(
        &self,
        codec: CodecAdapter,
        transport: Arc<dyn MediaTransport>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let stats = Arc::clone(&self.stats);
        let duration = self.frame_duration;

        self.active.store(true, Ordering::SeqCst);
        tokio::spawn(run_send_worker(queue, codec, transport, duration, stats))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Schließt die Queue; der Worker beendet sich beim nächsten Frame
    pub fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.queue.close();
    }
}

impl std::fmt::Debug for SendPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("queue", &self.queue)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn run_send_worker(
    queue: Arc<FrameQueue>,
    mut codec: CodecAdapter,
    transport: Arc<dyn MediaTransport>,
    duration: Duration,
    stats: Arc<PipelineStats>,
) {
    tracing::info!("Send worker started");

    while let Some(frame) = queue.pop().await {
        let encoded = match codec.encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                PipelineStats::bump(&stats.encode_failures);
                tracing::warn!("Skipping frame, encode failed: {}", e);
                continue;
            }
        };

        // Call wurde während des Encodings beendet
        if queue.is_closed() {
            tracing::debug!("Discarding encoded frame after session end");
            break;
        }

        match transport.write_sample(encoded, duration).await {
            Ok(()) => PipelineStats::bump(&stats.frames_sent),
            Err(e) => tracing::warn!("Failed to write audio sample: {}", e),
        }
    }

    tracing::info!(
        "Send worker stopped after {} frame(s)",
        stats.frames_sent.load(Ordering::Relaxed)
    );
}

// ============================================================================
// RECEIVE PIPELINE
// ============================================================================

/// Startet einen Receive-Worker für einen eingehenden Track
pub fn spawn_receive_worker(
    track: Arc<dyn InboundTrack>,
    codec: CodecAdapter,
    max_depth: usize,
    output: Arc<FrameQueue>,
    stats: Arc<PipelineStats>,
) -> JoinHandle<()> {
    tokio::spawn(run_receive_worker(track, codec, max_depth, output, stats))
}

async fn run_receive_worker(
    track: Arc<dyn InboundTrack>,
    mut codec: CodecAdapter,
    max_depth: usize,
    output: Arc<FrameQueue>,
    stats: Arc<PipelineStats>,
) {
    tracing::info!("Receive worker started for {:?}", track);
    let mut jitter = JitterReassembler::new(max_depth);

    loop {
        let released = match track.read_packet().await {
            Ok(Some(packet)) => jitter.push(packet),
            Ok(None) => {
                tracing::info!("Inbound track ended");
                let rest = jitter.drain();
                deliver(&mut codec, rest, &output, &stats);
                break;
            }
            Err(e) => {
                tracing::warn!("Inbound track read failed: {}", e);
                break;
            }
        };

        if !deliver(&mut codec, released, &output, &stats) {
            break;
        }
    }

    tracing::info!(
        "Receive worker stopped ({} lost, {} discarded)",
        jitter.lost(),
        jitter.discarded()
    );
}

/// Dekodiert freigegebene Pakete; `false` sobald die Output-Queue geschlossen ist
fn deliver(
    codec: &mut CodecAdapter,
    packets: Vec<super::jitter::EncodedPacket>,
    output: &FrameQueue,
    stats: &PipelineStats,
) -> bool {
    for packet in packets {
        let frame = match codec.decode(&packet.payload) {
            Ok(frame) => frame,
            Err(e) => {
                PipelineStats::bump(&stats.decode_failures);
                tracing::warn!("Skipping packet {}, decode failed: {}", packet.sequence, e);
                continue;
            }
        };

        match output.push(frame) {
            EnqueueOutcome::Queued => PipelineStats::bump(&stats.frames_decoded),
            EnqueueOutcome::Dropped => PipelineStats::bump(&stats.playback_dropped),
            EnqueueOutcome::Rejected => return false,
        }
    }
    !output.is_closed()
}
