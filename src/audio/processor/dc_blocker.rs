//! One-pole DC removal filter.

use crate::audio::sample::AudioSample;

/// Pole of the high-pass filter. Cutoff is about 38 Hz at 48 kHz.
const POLE: f64 = 0.995;

/// `y[n] = x[n] - x[n-1] + R * y[n-1]`, run independently per channel.
pub struct DcBlocker {
    channels: usize,
    prev_in: Vec<f64>,
    prev_out: Vec<f64>,
}

impl DcBlocker {
    pub fn new(channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            prev_in: vec![0.0; channels],
            prev_out: vec![0.0; channels],
        }
    }

    pub fn reset(&mut self) {
        self.prev_in.fill(0.0);
        self.prev_out.fill(0.0);
    }

    /// Filters interleaved `data` in place.
    pub fn process<S: AudioSample>(&mut self, data: &mut [S]) {
        for (i, sample) in data.iter_mut().enumerate() {
            let ch = i % self.channels;
            let x = sample.to_f64_normalized();
            let y = x - self.prev_in[ch] + POLE * self.prev_out[ch];
            self.prev_in[ch] = x;
            self.prev_out[ch] = y;
            *sample = S::from_f64_normalized(y);
        }
    }
}
