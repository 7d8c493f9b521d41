//! Owned context shared by every call in the process.
//!
//! [`AudioRuntime`] holds the shared capture ring buffer fed by the audio
//! device, the backend that opens capture sources on it, and the registry of
//! per-call ring buffers. Everything else is built from it and receives what
//! it needs by reference.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::audio::ring_buffer::RingBuffer;
use crate::config::{PipelineConfig, SessionConfig};
use crate::error::Result;
use crate::io::device::DeviceCapture;
use crate::io::source::{CaptureBackend, RuntimeBackend};
use crate::session::{AudioInput, AudioRtpSession};

pub const DEVICE_RING_ID: &str = "device";
pub const DEFAULT_DEVICE_NAME: &str = "default";

pub struct AudioRuntime {
    config: PipelineConfig,
    device_ring: Arc<RingBuffer>,
    backend: Arc<dyn CaptureBackend>,
    call_buffers: DashMap<String, Arc<RingBuffer>>,
}

impl AudioRuntime {
    pub fn new(config: PipelineConfig) -> Self {
        let device_ring = Self::new_device_ring(&config);
        let backend = Arc::new(RuntimeBackend::new(device_ring.clone(), DEFAULT_DEVICE_NAME));
        Self::build(config, device_ring, backend)
    }

    /// Runtime whose capture sources come from `backend` instead of the
    /// shared device ring buffer.
    pub fn with_backend(config: PipelineConfig, backend: Arc<dyn CaptureBackend>) -> Self {
        let device_ring = Self::new_device_ring(&config);
        Self::build(config, device_ring, backend)
    }

    fn new_device_ring(config: &PipelineConfig) -> Arc<RingBuffer> {
        Arc::new(RingBuffer::new(
            DEVICE_RING_ID,
            config.device_format,
            config.ring_capacity_frames,
            config.device_frame_size(),
        ))
    }

    fn build(config: PipelineConfig, device_ring: Arc<RingBuffer>, backend: Arc<dyn CaptureBackend>) -> Self {
        info!(
            "Audio runtime: device {}, calls {}, {:?} frames",
            config.device_format, config.call_format, config.frame_duration
        );
        Self {
            config,
            device_ring,
            backend,
            call_buffers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ring buffer the capture device writes into.
    pub fn device_ring(&self) -> &Arc<RingBuffer> {
        &self.device_ring
    }

    /// Starts feeding the default input device into the device ring buffer.
    pub fn start_device_capture(&self) -> Result<DeviceCapture> {
        DeviceCapture::start(self.device_ring.clone())
    }

    /// Returns the call's ring buffer, creating it on first use.
    pub fn create_call_buffer(&self, call_id: &str) -> Arc<RingBuffer> {
        self.call_buffers
            .entry(call_id.to_string())
            .or_insert_with(|| {
                debug!("Creating ring buffer for call '{}'", call_id);
                Arc::new(RingBuffer::new(
                    call_id,
                    self.config.call_format,
                    self.config.ring_capacity_frames,
                    self.config.call_frame_size(),
                ))
            })
            .clone()
    }

    pub fn call_buffer(&self, call_id: &str) -> Option<Arc<RingBuffer>> {
        self.call_buffers.get(call_id).map(|b| b.clone())
    }

    pub fn remove_call_buffer(&self, call_id: &str) -> Option<Arc<RingBuffer>> {
        let removed = self.call_buffers.remove(call_id).map(|(_, b)| b);
        if removed.is_some() {
            debug!("Removed ring buffer for call '{}'", call_id);
        }
        removed
    }

    pub fn call_count(&self) -> usize {
        self.call_buffers.len()
    }

    pub fn create_audio_input(&self, id: &str) -> Arc<AudioInput> {
        AudioInput::new(id, &self.config, self.backend.clone())
    }

    /// Session for `call_id`, with its own capture pump and the call's ring
    /// buffer.
    pub fn create_session(&self, call_id: &str, config: SessionConfig) -> AudioRtpSession {
        let input = self.create_audio_input(call_id);
        let ring = self.create_call_buffer(call_id);
        AudioRtpSession::new(call_id, config, &self.config, input, ring)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audio::format::AudioFormat;
    use crate::audio::frame::AudioFrame;

    fn runtime() -> AudioRuntime {
        AudioRuntime::new(PipelineConfig {
            device_format: AudioFormat::mono(16000),
            call_format: AudioFormat::mono(8000),
            ..Default::default()
        })
    }

    #[test]
    fn test_call_buffers_are_per_call() {
        let runtime = runtime();
        let a = runtime.create_call_buffer("a");
        let again = runtime.create_call_buffer("a");
        let b = runtime.create_call_buffer("b");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.format(), AudioFormat::mono(8000));
        assert_eq!(a.frame_size(), 160);
        assert_eq!(runtime.call_count(), 2);

        assert!(runtime.remove_call_buffer("a").is_some());
        assert!(runtime.call_buffer("a").is_none());
        assert!(runtime.remove_call_buffer("a").is_none());
    }

    #[test]
    fn test_inputs_read_the_device_ring() {
        let runtime = runtime();
        let input = runtime.create_audio_input("call");
        let params = input.switch_input("").wait(Duration::from_secs(2)).unwrap();
        assert_eq!(params.format, AudioFormat::mono(16000));
        assert_eq!(params.name, DEFAULT_DEVICE_NAME);
        assert_eq!(runtime.device_ring().reader_count(), 1);

        runtime
            .device_ring()
            .put(AudioFrame::from_i16(16000, 1, vec![0; 320]).unwrap())
            .unwrap();
        input.stop();
        assert_eq!(runtime.device_ring().reader_count(), 0);
    }

    #[test]
    fn test_session_uses_call_buffer() {
        let runtime = runtime();
        let session = runtime.create_session("call", SessionConfig::default());
        assert!(Arc::ptr_eq(session.ring_buffer(), &runtime.create_call_buffer("call")));
        assert_eq!(session.id(), "call");
    }
}
