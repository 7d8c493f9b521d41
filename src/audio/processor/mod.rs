//! Capture-side filter chain.
//!
//! The chain is built once from [`ProcessingConfig`] and runs every captured
//! frame through its stages in order: DC removal, noise suppression, voice
//! detection.

pub mod dc_blocker;
pub mod noise_gate;
pub mod vad;

use tracing::{info, warn};

use crate::audio::format::AudioFormat;
use crate::audio::frame::{AudioFrame, Samples};
use crate::config::ProcessingConfig;

pub use dc_blocker::DcBlocker;
pub use noise_gate::NoiseGate;
pub use vad::{VoiceDetector, calculate_rms_level};

pub enum ProcessingStage {
    DcBlocker(DcBlocker),
    NoiseGate(NoiseGate),
    VoiceDetector(VoiceDetector),
}

impl ProcessingStage {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingStage::DcBlocker(_) => "dc-blocker",
            ProcessingStage::NoiseGate(_) => "noise-gate",
            ProcessingStage::VoiceDetector(_) => "voice-detector",
        }
    }

    fn apply(&mut self, frame: &mut AudioFrame) {
        match self {
            ProcessingStage::DcBlocker(blocker) => match frame.samples_mut() {
                Samples::S16(v) => blocker.process(v),
                Samples::F32(v) => blocker.process(v),
            },
            ProcessingStage::NoiseGate(gate) => match frame.samples_mut() {
                Samples::S16(v) => gate.process(v),
                Samples::F32(v) => gate.process(v),
            },
            ProcessingStage::VoiceDetector(vad) => {
                frame.voice = match frame.samples() {
                    Samples::S16(v) => vad.detect(v),
                    Samples::F32(v) => vad.detect(v),
                };
            }
        }
    }
}

pub struct AudioProcessor {
    config: ProcessingConfig,
    format: AudioFormat,
    stages: Vec<ProcessingStage>,
}

impl AudioProcessor {
    pub fn new(config: &ProcessingConfig, format: AudioFormat) -> Self {
        if config.echo_cancellation {
            warn!("Echo cancellation requested but unavailable, continuing without it");
        }
        let stages = Self::build_stages(config, format);
        info!(
            "Audio processor for {}: [{}]",
            format,
            stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        );
        Self {
            config: config.clone(),
            format,
            stages,
        }
    }

    fn build_stages(config: &ProcessingConfig, format: AudioFormat) -> Vec<ProcessingStage> {
        let mut stages = Vec::new();
        if config.dc_blocker {
            stages.push(ProcessingStage::DcBlocker(DcBlocker::new(format.channels as usize)));
        }
        if config.noise_suppression {
            stages.push(ProcessingStage::NoiseGate(NoiseGate::new(
                config.noise_gate_threshold,
                config.noise_gate_window,
            )));
        }
        if config.voice_detection {
            stages.push(ProcessingStage::VoiceDetector(VoiceDetector::new(
                config.voice_threshold,
                config.voice_hangover,
            )));
        }
        stages
    }

    pub fn is_echo_cancellation_available() -> bool {
        false
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs `frame` through every stage. Filter state is rebuilt when the
    /// frame format changes.
    pub fn process(&mut self, frame: &mut AudioFrame) {
        if frame.format() != self.format {
            self.format = frame.format();
            self.stages = Self::build_stages(&self.config, self.format);
        }
        for stage in &mut self.stages {
            stage.apply(frame);
        }
    }
}
