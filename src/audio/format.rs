//! Audio format description.

use std::fmt;
use std::time::Duration;

/// In-memory representation of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    S16,
    F32,
}

/// Sample rate, channel count and sample representation of a stream.
///
/// Samples are always interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    pub const fn mono(sample_rate: u32) -> Self {
        Self::new(sample_rate, 1, SampleFormat::S16)
    }

    pub const fn stereo(sample_rate: u32) -> Self {
        Self::new(sample_rate, 2, SampleFormat::S16)
    }

    /// Same layout with a different sample representation.
    pub const fn with_sample_format(self, sample_format: SampleFormat) -> Self {
        Self::new(self.sample_rate, self.channels, sample_format)
    }

    /// Samples per channel covering `duration`, rounded down.
    pub fn samples_for(&self, duration: Duration) -> usize {
        (self.sample_rate as u128 * duration.as_micros() / 1_000_000) as usize
    }

    pub fn duration_of(&self, samples_per_channel: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(samples_per_channel as u64 * 1_000_000 / self.sample_rate as u64)
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channels > 0
    }
}

impl Default for AudioFormat {
    /// 48 kHz stereo, 16 bit.
    fn default() -> Self {
        Self::stereo(48000)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{} Hz, {} ch, {:?}}}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_for_twenty_ms() {
        assert_eq!(AudioFormat::mono(8000).samples_for(Duration::from_millis(20)), 160);
        assert_eq!(AudioFormat::stereo(48000).samples_for(Duration::from_millis(20)), 960);
    }

    #[test]
    fn test_formats_compare_by_value() {
        let a = AudioFormat::mono(16000);
        assert_eq!(a, AudioFormat::new(16000, 1, SampleFormat::S16));
        assert_ne!(a, a.with_sample_format(SampleFormat::F32));
    }
}
