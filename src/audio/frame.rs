use std::time::Duration;

use crate::audio::format::{AudioFormat, SampleFormat};
use crate::audio::sample::{AudioSample, convert_samples};
use crate::error::{PipelineError, Result};

/// Interleaved sample storage in one of the supported representations.
#[derive(Debug, Clone, PartialEq)]
pub enum Samples {
    S16(Vec<i16>),
    F32(Vec<f32>),
}

impl Samples {
    pub fn silence(sample_format: SampleFormat, len: usize) -> Self {
        match sample_format {
            SampleFormat::S16 => Samples::S16(vec![i16::silence(); len]),
            SampleFormat::F32 => Samples::F32(vec![f32::silence(); len]),
        }
    }

    pub fn empty(sample_format: SampleFormat) -> Self {
        Self::silence(sample_format, 0)
    }

    pub fn sample_format(&self) -> SampleFormat {
        match self {
            Samples::S16(_) => SampleFormat::S16,
            Samples::F32(_) => SampleFormat::F32,
        }
    }

    /// Total sample count over all channels.
    pub fn len(&self) -> usize {
        match self {
            Samples::S16(v) => v.len(),
            Samples::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `other`, converting its representation if it differs.
    pub fn extend_from(&mut self, other: &Samples) {
        match (self, other) {
            (Samples::S16(a), Samples::S16(b)) => a.extend_from_slice(b),
            (Samples::F32(a), Samples::F32(b)) => a.extend_from_slice(b),
            (Samples::S16(a), Samples::F32(b)) => a.extend(convert_samples::<f32, i16>(b)),
            (Samples::F32(a), Samples::S16(b)) => a.extend(convert_samples::<i16, f32>(b)),
        }
    }

    /// Removes and returns the first `len` samples.
    pub fn drain_front(&mut self, len: usize) -> Samples {
        match self {
            Samples::S16(v) => {
                let len = len.min(v.len());
                Samples::S16(v.drain(..len).collect())
            }
            Samples::F32(v) => {
                let len = len.min(v.len());
                Samples::F32(v.drain(..len).collect())
            }
        }
    }

    pub fn prepend_silence(&mut self, len: usize) {
        match self {
            Samples::S16(v) => {
                v.splice(0..0, std::iter::repeat_n(i16::silence(), len));
            }
            Samples::F32(v) => {
                v.splice(0..0, std::iter::repeat_n(f32::silence(), len));
            }
        }
    }

    pub fn fill_silence(&mut self) {
        match self {
            Samples::S16(v) => v.fill(i16::silence()),
            Samples::F32(v) => v.fill(f32::silence()),
        }
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Samples::S16(v) => v.iter().map(|s| s.to_f64_normalized()).collect(),
            Samples::F32(v) => v.iter().map(|s| s.to_f64_normalized()).collect(),
        }
    }

    pub fn from_f64(sample_format: SampleFormat, data: &[f64]) -> Self {
        match sample_format {
            SampleFormat::S16 => {
                Samples::S16(data.iter().map(|&s| i16::from_f64_normalized(s)).collect())
            }
            SampleFormat::F32 => {
                Samples::F32(data.iter().map(|&s| f32::from_f64_normalized(s)).collect())
            }
        }
    }

    pub fn to_i16(&self) -> Vec<i16> {
        match self {
            Samples::S16(v) => v.clone(),
            Samples::F32(v) => convert_samples(v),
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Samples::S16(v) => convert_samples(v),
            Samples::F32(v) => v.clone(),
        }
    }
}

/// A buffer of interleaved samples tagged with its format and timing.
///
/// Frames are handed between pipeline stages by value or as
/// `Arc<AudioFrame>`; a frame is not modified after it leaves its producer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    format: AudioFormat,
    samples: Samples,
    /// Presentation timestamp, in samples per channel since the stream start.
    pub pts: u64,
    /// Voice activity as reported by the capture processor.
    pub voice: bool,
}

impl AudioFrame {
    /// Creates a frame, checking that the data matches `format`.
    pub fn new(format: AudioFormat, samples: Samples, pts: u64) -> Result<Self> {
        if samples.sample_format() != format.sample_format {
            return Err(PipelineError::Configuration(format!(
                "{:?} samples cannot carry format {}",
                samples.sample_format(),
                format
            )));
        }
        if format.channels == 0 || samples.len() % format.channels as usize != 0 {
            return Err(PipelineError::Configuration(format!(
                "Data length {} must be a multiple of channels {}",
                samples.len(),
                format.channels
            )));
        }
        Ok(Self {
            format,
            samples,
            pts,
            voice: false,
        })
    }

    pub fn silence(format: AudioFormat, samples_per_channel: usize, pts: u64) -> Self {
        Self {
            format,
            samples: Samples::silence(
                format.sample_format,
                samples_per_channel * format.channels as usize,
            ),
            pts,
            voice: false,
        }
    }

    pub fn from_i16(sample_rate: u32, channels: u16, data: Vec<i16>) -> Result<Self> {
        Self::new(
            AudioFormat::new(sample_rate, channels, SampleFormat::S16),
            Samples::S16(data),
            0,
        )
    }

    pub fn from_f32(sample_rate: u32, channels: u16, data: Vec<f32>) -> Result<Self> {
        Self::new(
            AudioFormat::new(sample_rate, channels, SampleFormat::F32),
            Samples::F32(data),
            0,
        )
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    /// Mutable access for the stage that currently owns the frame.
    pub fn samples_mut(&mut self) -> &mut Samples {
        &mut self.samples
    }

    pub fn into_samples(self) -> Samples {
        self.samples
    }

    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.format.channels as usize
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.samples_per_channel())
    }

    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = pts;
        self
    }

    /// Replaces every sample with silence, keeping length and timing.
    pub fn mute(&mut self) {
        self.samples.fill_silence();
        self.voice = false;
    }

    pub fn is_silent(&self) -> bool {
        match &self.samples {
            Samples::S16(v) => v.iter().all(|&s| s == 0),
            Samples::F32(v) => v.iter().all(|&s| s == 0.0),
        }
    }
}
