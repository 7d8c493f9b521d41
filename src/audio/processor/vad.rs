//! Level-based voice activity detection.

use crate::audio::sample::AudioSample;

/// RMS level of `samples` on a 0-100 scale.
pub fn calculate_rms_level<S: AudioSample>(samples: &[S]) -> u32 {
    if samples.is_empty() {
        return 0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|s| {
            let v = s.to_f64_normalized();
            v * v
        })
        .sum();
    let rms = (sum_sq / samples.len() as f64).sqrt();
    (rms * 100.0).min(100.0) as u32
}

/// Flags frames whose level reaches `threshold`, holding the flag for
/// `hangover` further frames so word endings are not clipped.
pub struct VoiceDetector {
    threshold: u32,
    hangover: u32,
    remaining: u32,
}

impl VoiceDetector {
    pub fn new(threshold: u32, hangover: u32) -> Self {
        Self {
            threshold,
            hangover,
            remaining: 0,
        }
    }

    pub fn detect<S: AudioSample>(&mut self, samples: &[S]) -> bool {
        if calculate_rms_level(samples) >= self.threshold {
            self.remaining = self.hangover;
            return true;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_level_scale() {
        assert_eq!(calculate_rms_level::<f32>(&[]), 0);
        assert_eq!(calculate_rms_level(&[0.5f32; 16]), 50);
        assert_eq!(calculate_rms_level(&[i16::MAX; 16]), 100);
    }

    #[test]
    fn test_hangover_keeps_voice_flag() {
        let mut vad = VoiceDetector::new(5, 2);
        assert!(vad.detect(&[0.2f32; 160]));
        assert!(vad.detect(&[0.0f32; 160]));
        assert!(vad.detect(&[0.0f32; 160]));
        assert!(!vad.detect(&[0.0f32; 160]));
    }
}
