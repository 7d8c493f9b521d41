//! Noise gate.

use std::collections::VecDeque;

use crate::audio::sample::AudioSample;

/// Silences samples whose sliding-window RMS energy is below a threshold.
pub struct NoiseGate {
    threshold: f64,
    window_size: usize,
    window: VecDeque<f64>,
    sum_sq: f64,
}

impl NoiseGate {
    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            window_size: window_size.max(1),
            window: VecDeque::with_capacity(window_size),
            sum_sq: 0.0,
        }
    }

    pub fn process<S: AudioSample>(&mut self, data: &mut [S]) {
        for sample in data.iter_mut() {
            let val = sample.to_f64_normalized();
            let sq = val * val;

            self.window.push_back(sq);
            self.sum_sq += sq;

            if self.window.len() > self.window_size {
                if let Some(old_sq) = self.window.pop_front() {
                    self.sum_sq -= old_sq;
                }
            }

            let rms = (self.sum_sq.max(0.0) / self.window.len() as f64).sqrt();
            if rms < self.threshold {
                *sample = S::silence();
            }
        }
    }
}
