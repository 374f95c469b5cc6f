//! Codec Adapter
//!
//! Encode/Decode von PCM-Frames. Der eigentliche Codec ist austauschbar;
//! Opus wird über das `opus` Feature eingebunden (benötigt libopus).

use super::audio::AudioFrame;
use crate::config::CallConfig;
use bytes::Bytes;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Codec initialization failed: {0}")]
    Init(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Frame has {actual} samples, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
}

// ============================================================================
// CODEC TRAITS
// ============================================================================

/// Parameter, die einmal bei Session-Erstellung festgelegt werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub max_encoded_size: usize,
}

impl CodecParams {
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: 1,
            frame_size: config.frame_size(),
            max_encoded_size: config.max_encoded_size,
        }
    }
}

/// RTP-Fähigkeit des Codecs für die Media-Negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
}

pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError>;
}

pub trait FrameDecoder: Send {
    fn decode(&mut self, payload: &[u8], frame_size: usize) -> Result<Vec<i16>, CodecError>;
}

/// Fabrik für zustandsbehaftete Encoder/Decoder (einer pro Pipeline)
pub trait AudioCodec: Send + Sync + std::fmt::Debug {
    fn capability(&self, params: &CodecParams) -> CodecCapability;
    fn encoder(&self, params: &CodecParams) -> Result<Box<dyn FrameEncoder>, CodecError>;
    fn decoder(&self, params: &CodecParams) -> Result<Box<dyn FrameDecoder>, CodecError>;
}

// ============================================================================
// CODEC ADAPTER
// ============================================================================

/// Erzwingt die feste Frame-Größe auf beiden Seiten des Codecs
pub struct CodecAdapter {
    params: CodecParams,
    encoder: Box<dyn FrameEncoder>,
    decoder: Box<dyn FrameDecoder>,
}

impl CodecAdapter {
    pub fn new(codec: &dyn AudioCodec, params: CodecParams) -> Result<Self, CodecError> {
        Ok(Self {
            params,
            encoder: codec.encoder(&params)?,
            decoder: codec.decoder(&params)?,
        })
    }

    pub fn params(&self) -> &CodecParams {
        &self.params
    }

    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Bytes, CodecError> {
        if frame.len() != self.params.frame_size {
            return Err(CodecError::FrameSize {
                expected: self.params.frame_size,
                actual: frame.len(),
            });
        }

        let encoded = self.encoder.encode(frame.samples())?;
        if encoded.len() > self.params.max_encoded_size {
            return Err(CodecError::Encode(format!(
                "encoded frame of {} bytes exceeds limit {}",
                encoded.len(),
                self.params.max_encoded_size
            )));
        }
        Ok(encoded)
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, CodecError> {
        let pcm = self.decoder.decode(payload, self.params.frame_size)?;
        if pcm.len() != self.params.frame_size {
            return Err(CodecError::FrameSize {
                expected: self.params.frame_size,
                actual: pcm.len(),
            });
        }
        Ok(AudioFrame::new(pcm))
    }
}

// ============================================================================
// OPUS
// ============================================================================

#[cfg(feature = "opus")]
pub use self::opus_codec::OpusCodec;

#[cfg(feature = "opus")]
mod opus_codec {
    use super::*;
    use opus::{Application, Channels, Decoder, Encoder};

    /// Opus im VoIP-Modus, mono
    #[derive(Debug, Clone, Copy, Default)]
    pub struct OpusCodec;

    struct OpusFrameEncoder {
        encoder: Encoder,
        buffer: Vec<u8>,
    }

    struct OpusFrameDecoder {
        decoder: Decoder,
    }

    fn channels(params: &CodecParams) -> Result<Channels, CodecError> {
        match params.channels {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            n => Err(CodecError::Init(format!("unsupported channel count {}", n))),
        }
    }

    impl AudioCodec for OpusCodec {
        fn capability(&self, params: &CodecParams) -> CodecCapability {
            // RTP Clock für Opus ist immer 48kHz (RFC 7587)
            CodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: params.channels,
            }
        }

        fn encoder(&self, params: &CodecParams) -> Result<Box<dyn FrameEncoder>, CodecError> {
            let encoder = Encoder::new(params.sample_rate, channels(params)?, Application::Voip)
                .map_err(|e| CodecError::Init(e.to_string()))?;
            Ok(Box::new(OpusFrameEncoder {
                encoder,
                buffer: vec![0u8; params.max_encoded_size],
            }))
        }

        fn decoder(&self, params: &CodecParams) -> Result<Box<dyn FrameDecoder>, CodecError> {
            let decoder = Decoder::new(params.sample_rate, channels(params)?)
                .map_err(|e| CodecError::Init(e.to_string()))?;
            Ok(Box::new(OpusFrameDecoder { decoder }))
        }
    }

    impl FrameEncoder for OpusFrameEncoder {
        fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
            let len = self
                .encoder
                .encode(pcm, &mut self.buffer)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            Ok(Bytes::copy_from_slice(&self.buffer[..len]))
        }
    }

    impl FrameDecoder for OpusFrameDecoder {
        fn decode(&mut self, payload: &[u8], frame_size: usize) -> Result<Vec<i16>, CodecError> {
            let mut pcm = vec![0i16; frame_size];
            let decoded = self
                .decoder
                .decode(payload, &mut pcm, false)
                .map_err(|e| CodecError::Decode(e.to_string()))?;
            pcm.truncate(decoded);
            Ok(pcm)
        }
    }

}

// ============================================================================
// TESTS
// ============================================================================
