//! Call Engine Module - WebRTC und Audio
//!
//! Dieses Modul verwaltet:
//! - Call Session State Machine
//! - WebRTC Media Transport
//! - Audio Send/Receive Pipelines mit Jitter Reassembly
//! - Codec Adapter (Opus über das `opus` Feature)
//! - Audio Devices (über das `device-audio` Feature)

mod audio;
mod codec;
#[cfg(feature = "device-audio")]
mod device;
mod jitter;
mod pipeline;
mod session;
mod transport;

pub use audio::{AudioError, AudioFrame, EnqueueOutcome, FrameQueue, PcmChunker};
#[cfg(feature = "opus")]
pub use codec::OpusCodec;
pub use codec::{
    AudioCodec, CodecAdapter, CodecCapability, CodecError, CodecParams, FrameDecoder,
    FrameEncoder,
};
#[cfg(feature = "device-audio")]
pub use device::{list_devices, AudioDeviceInfo, DeviceAudio};
pub use jitter::{EncodedPacket, JitterReassembler};
pub use pipeline::{spawn_receive_worker, PipelineSnapshot, PipelineStats, SendPipeline};
pub use session::{
    new_call_id, CallError, CallEvent, CallIdentity, CallSession, CallState, SessionEvent,
};
pub use transport::{
    InboundTrack, MediaTransport, TransportError, TransportEvent, TransportFactory,
    TransportState, WebRtcTransport, WebRtcTransportFactory,
};
