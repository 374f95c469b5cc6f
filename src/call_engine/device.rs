//! Audio Devices - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O und liefert bzw. nimmt
//! 20ms Mono-Frames im Format der Call Session.

use super::audio::{AudioError, AudioFrame};
use crate::config::CallConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use serde::Serialize;
use std::sync::Arc;

/// Ring-Buffer fasst 10 Frames pro Richtung
const BUFFERED_FRAMES: usize = 10;

/// Beschreibung eines Audio-Geräts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
}

/// Listet alle Ein- und Ausgabegeräte des Default-Hosts
pub fn list_devices() -> Result<Vec<AudioDeviceInfo>, AudioError> {
    let host = cpal::default_host();
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();

    let inputs = host
        .input_devices()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
    for device in inputs {
        if let Ok(name) = device.name() {
            devices.push(AudioDeviceInfo {
                is_default: default_input.as_deref() == Some(name.as_str()),
                is_input: true,
                name,
            });
        }
    }

    let outputs = host
        .output_devices()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
    for device in outputs {
        if let Ok(name) = device.name() {
            devices.push(AudioDeviceInfo {
                is_default: default_output.as_deref() == Some(name.as_str()),
                is_input: false,
                name,
            });
        }
    }

    Ok(devices)
}

// ============================================================================
// DEVICE AUDIO
// ============================================================================

/// Mikrofon und Lautsprecher für einen Call
///
/// cpal Streams sind nicht `Send`; die Instanz bleibt auf dem Thread,
/// der sie erstellt hat.
pub struct DeviceAudio {
    input_device: Option<Device>,
    output_device: Option<Device>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    sample_rate: u32,
    frame_size: usize,

    /// Aufgenommenes Audio (mono, Ziel-Samplerate)
    capture_buffer: Arc<Mutex<HeapRb<i16>>>,

    /// Zu spielendes Audio (mono, Ziel-Samplerate)
    playback_buffer: Arc<Mutex<HeapRb<i16>>>,

    is_muted: Arc<Mutex<bool>>,

    /// Audio Level (0.0 - 1.0)
    input_level: Arc<Mutex<f32>>,
    output_level: Arc<Mutex<f32>>,
}

impl DeviceAudio {
    pub fn new(config: &CallConfig) -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let input_device = host.default_input_device();
        let output_device = host.default_output_device();

        if input_device.is_none() {
            tracing::warn!("No audio input device found");
        }
        if output_device.is_none() {
            tracing::warn!("No audio output device found");
        }

        let frame_size = config.frame_size();
        let capacity = frame_size * BUFFERED_FRAMES;

        tracing::info!(
            "DeviceAudio initialized: {}Hz, {} samples per frame",
            config.sample_rate,
            frame_size
        );

        Ok(Self {
            input_device,
            output_device,
            input_stream: None,
            output_stream: None,
            sample_rate: config.sample_rate,
            frame_size,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(capacity))),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(capacity))),
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
            output_level: Arc::new(Mutex::new(0.0)),
        })
    }

    /// Startet Audio Capture (Mikrofon)
    pub fn start_capture(&mut self) -> Result<(), AudioError> {
        let device = self
            .input_device
            .as_ref()
            .ok_or(AudioError::NoInputDevice)?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(supported.collect(), self.sample_rate)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let source_rate = config.sample_rate.0;
        let target_rate = self.sample_rate;
        let channels = usize::from(config.channels);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    *input_level.lock() = rms(&mono);

                    if *is_muted.lock() {
                        return;
                    }

                    let samples = resample_linear(&mono, source_rate, target_rate);
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        // Voller Buffer: ältere Samples behalten
                        let _ = buffer.try_push(to_i16(sample));
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    /// Startet Audio Playback (Lautsprecher)
    pub fn start_playback(&mut self) -> Result<(), AudioError> {
        let device = self
            .output_device
            .as_ref()
            .ok_or(AudioError::NoOutputDevice)?;

        let supported = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(supported.collect(), self.sample_rate)?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let output_level = Arc::clone(&self.output_level);
        let ratio = self.sample_rate as f32 / config.sample_rate.0 as f32;
        let channels = usize::from(config.channels);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    let frames = data.len() / channels;

                    let mut level_sum = 0.0f32;
                    let mut consumed = 0.0f32;
                    let mut current = 0.0f32;

                    for i in 0..frames {
                        // Nearest-Neighbour Resampling von der Call-Samplerate
                        consumed += ratio;
                        while consumed >= 1.0 {
                            current = buffer.try_pop().map(to_f32).unwrap_or(0.0);
                            consumed -= 1.0;
                        }
                        level_sum += current.abs();

                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = current;
                            }
                        }
                    }

                    if frames > 0 {
                        *output_level.lock() = (level_sum / frames as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        self.output_stream = Some(stream);
        Ok(())
    }

    /// Stoppt alle Audio-Streams
    pub fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        self.capture_buffer.lock().clear();
        self.playback_buffer.lock().clear();
        tracing::info!("Audio streams stopped");
    }

    /// Liest einen vollständigen Frame vom Mikrofon
    pub fn read_frame(&self) -> Option<AudioFrame> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < self.frame_size {
            return None;
        }
        let samples: Vec<i16> = (0..self.frame_size)
            .filter_map(|_| buffer.try_pop())
            .collect();
        Some(AudioFrame::new(samples))
    }

    /// Schreibt einen Frame in den Playback-Buffer
    pub fn write_frame(&self, frame: &AudioFrame) {
        let mut buffer = self.playback_buffer.lock();
        let pushed = buffer.push_slice(frame.samples());
        if pushed < frame.len() {
            tracing::trace!("Playback buffer full, dropped {} samples", frame.len() - pushed);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn levels(&self) -> (f32, f32) {
        (*self.input_level.lock(), *self.output_level.lock())
    }
}

impl std::fmt::Debug for DeviceAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAudio")
            .field("sample_rate", &self.sample_rate)
            .field("frame_size", &self.frame_size)
            .field("capturing", &self.input_stream.is_some())
            .field("playing", &self.output_stream.is_some())
            .finish()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Priorität: Ziel-Samplerate mit F32 > F32 mit anderer Rate > erste Konfiguration
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(sample_rate);
    let supports_target = |config: &SupportedStreamConfigRange| {
        config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate
    };

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    configs
        .first()
        .map(|config| config.clone().with_max_sample_rate().into())
        .ok_or_else(|| {
            AudioError::UnsupportedConfig("No suitable audio configuration found".to_string())
        })
}

fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn resample_linear(data: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || data.is_empty() {
        return data.to_vec();
    }
    let ratio = to as f32 / from as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src = i as f32 / ratio;
            let idx = src as usize;
            let frac = src - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32)
        .sqrt()
        .min(1.0)
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn to_f32(sample: i16) -> f32 {
    f32::from(sample) / f32::from(i16::MAX)
}

// ============================================================================
// TESTS
// ============================================================================
