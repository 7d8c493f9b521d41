//! Configuration for the audio runtime, processing chain and RTP sessions.

use std::time::Duration;

use crate::audio::format::AudioFormat;
use crate::codec::AudioCodec;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Pump cadence and default frame length.
    pub frame_duration: Duration,
    /// Slots per ring buffer.
    pub ring_capacity_frames: usize,
    /// Format of the shared capture ring buffer fed by the device.
    pub device_format: AudioFormat,
    /// Format of per-call receive ring buffers.
    pub call_format: AudioFormat,
    pub switch_timeout: Duration,
    pub mtu: usize,
    pub processing: ProcessingConfig,
}

impl PipelineConfig {
    pub fn device_frame_size(&self) -> usize {
        self.device_format.samples_for(self.frame_duration)
    }

    pub fn call_frame_size(&self) -> usize {
        self.call_format.samples_for(self.frame_duration)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_duration: Duration::from_millis(20),
            ring_capacity_frames: 64,
            device_format: AudioFormat::stereo(48000),
            call_format: AudioFormat::stereo(48000),
            switch_timeout: Duration::from_secs(2),
            mtu: 1500,
            processing: ProcessingConfig::default(),
        }
    }
}

/// Capability flags for the capture processing chain.
#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub dc_blocker: bool,
    pub noise_suppression: bool,
    pub voice_detection: bool,
    /// Requested but not backed by any implementation in this build.
    pub echo_cancellation: bool,
    /// Normalized RMS below which the noise gate silences samples.
    pub noise_gate_threshold: f64,
    pub noise_gate_window: usize,
    /// Level (0-100) from which a frame counts as voice.
    pub voice_threshold: u32,
    /// Frames the voice flag is held after the level drops.
    pub voice_hangover: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            dc_blocker: true,
            noise_suppression: false,
            voice_detection: true,
            echo_cancellation: false,
            noise_gate_threshold: 0.01,
            noise_gate_window: 1024,
            voice_threshold: 2,
            voice_hangover: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Codec the local sender encodes with.
    pub send_codec: AudioCodec,
    /// Codec the remote side sends, as negotiated.
    pub receive_codec: AudioCodec,
    pub payload_type: u8,
    /// Random when unset.
    pub ssrc: Option<u32>,
    /// How long a blocking receive on sockets the session binds itself waits
    /// before re-checking the running flag.
    pub receive_poll: Duration,
}

impl SessionConfig {
    /// Same codec in both directions.
    pub fn with_codec(codec: AudioCodec) -> Self {
        Self {
            send_codec: codec.clone(),
            receive_codec: codec,
            ..Default::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_codec: AudioCodec::default(),
            receive_codec: AudioCodec::default(),
            payload_type: 111,
            ssrc: None,
            receive_poll: Duration::from_millis(100),
        }
    }
}
