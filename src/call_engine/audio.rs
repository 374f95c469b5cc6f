//! Audio Frames und Queues
//!
//! PCM-Konvertierung an der Schnittstelle (little-endian i16) und die
//! begrenzten Frame-Queues zwischen Capture, Pipelines und Playback.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Notify;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("PCM byte buffer has odd length {0}")]
    OddByteLength(usize),

    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Ein 20ms Block linearer PCM Samples (mono)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn silence(frame_size: usize) -> Self {
        Self {
            samples: vec![0; frame_size],
        }
    }

    /// Little-endian i16 Bytepaare → Samples
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, AudioError> {
        if bytes.len() % 2 != 0 {
            return Err(AudioError::OddByteLength(bytes.len()));
        }
        Ok(Self {
            samples: bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ============================================================================
// PCM CHUNKER
// ============================================================================

/// Zerlegt beliebig lange PCM-Bytes in Frames fester Größe
///
/// Ein Rest (auch ein einzelnes ungerades Byte) bleibt bis zum nächsten
/// Aufruf gepuffert.
#[derive(Debug)]
pub struct PcmChunker {
    frame_size: usize,
    pending: Vec<u8>,
}

impl PcmChunker {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(bytes);

        let frame_bytes = self.frame_size * 2;
        let complete = self.pending.len() / frame_bytes;
        let mut frames = Vec::with_capacity(complete);

        for chunk in self.pending.chunks_exact(frame_bytes) {
            // Länge ist immer gerade, daher kein Fehlerfall
            if let Ok(frame) = AudioFrame::from_le_bytes(chunk) {
                frames.push(frame);
            }
        }
        self.pending.drain(..complete * frame_bytes);
        frames
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// FRAME QUEUE
// ============================================================================

/// Ergebnis von [`FrameQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue voll, der neue Frame wurde verworfen
    Dropped,
    /// Queue geschlossen oder Pipeline noch nicht aktiv
    Rejected,
}

/// Begrenzte Frame-Queue: nicht-blockierender Producer, wartender Consumer
///
/// Ist die Queue voll, wird der *neue* Frame verworfen. Bereits gequeute
/// Frames bleiben in FIFO-Reihenfolge erhalten.
pub struct FrameQueue {
    buffer: Mutex<HeapRb<AudioFrame>>,
    notify: Notify,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(HeapRb::new(capacity.max(1))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, frame: AudioFrame) -> EnqueueOutcome {
        if self.is_closed() {
            return EnqueueOutcome::Rejected;
        }

        let pushed = self.buffer.lock().try_push(frame).is_ok();
        if pushed {
            self.notify.notify_one();
            EnqueueOutcome::Queued
        } else {
            EnqueueOutcome::Dropped
        }
    }

    pub fn try_pop(&self) -> Option<AudioFrame> {
        if self.is_closed() {
            return None;
        }
        self.buffer.lock().try_pop()
    }

    /// Wartet auf den nächsten Frame; `None` sobald die Queue geschlossen ist
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            if self.is_closed() {
                return None;
            }
            let next = self.buffer.lock().try_pop();
            if let Some(frame) = next {
                return Some(frame);
            }
            self.notify.notified().await;
        }
    }

    /// Blockierende Variante für Audio-Threads außerhalb der Runtime
    pub fn pop_blocking(&self) -> Option<AudioFrame> {
        futures::executor::block_on(self.pop())
    }

    /// Schließt die Queue und verwirft alle gepufferten Frames
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.buffer.lock().clear();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
