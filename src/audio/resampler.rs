//! Format conversion between two [`AudioFormat`]s.
//!
//! Converts sample representation, channel layout and sample rate. The rate
//! converter keeps filter state between calls, so one [`Resampler`] must only
//! be fed a single continuous stream and must stay on one thread.

use rubato::{FftFixedIn, Resampler as _};
use tracing::{debug, info, warn};

use crate::audio::format::AudioFormat;
use crate::audio::frame::{AudioFrame, Samples};
use crate::error::{PipelineError, Result};

const FFT_SUB_CHUNKS: usize = 2;

/// Rate conversion with an input accumulator, so any input length is accepted.
struct RateConverter {
    inner: FftFixedIn<f64>,
    pending: Vec<Vec<f64>>,
}

impl RateConverter {
    fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        // 10 ms chunks
        let chunk_size = (input_rate / 100).max(1) as usize;
        let inner = FftFixedIn::<f64>::new(
            input_rate as usize,
            output_rate as usize,
            chunk_size,
            FFT_SUB_CHUNKS,
            channels,
        )
        .map_err(|e| {
            PipelineError::Configuration(format!(
                "Cannot convert {input_rate} Hz to {output_rate} Hz: {e}"
            ))
        })?;

        Ok(Self {
            inner,
            pending: vec![Vec::new(); channels],
        })
    }

    fn process(&mut self, input: Vec<Vec<f64>>) -> Result<Vec<Vec<f64>>> {
        for (pending, channel) in self.pending.iter_mut().zip(input) {
            pending.extend(channel);
        }

        let mut output = vec![Vec::new(); self.pending.len()];
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f64>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..needed).collect())
                .collect();
            let converted = self
                .inner
                .process(&chunk, None)
                .map_err(|e| PipelineError::Configuration(format!("Resampling failed: {e}")))?;
            for (out, conv) in output.iter_mut().zip(converted) {
                out.extend(conv);
            }
        }
        Ok(output)
    }
}

struct Context {
    input: AudioFormat,
    output: AudioFormat,
    rate: Option<RateConverter>,
    first_frame: bool,
}

/// Stateful converter whose context is rebuilt only when the
/// (input, output) format pair changes.
pub struct Resampler {
    context: Option<Context>,
    reinit_count: u64,
    #[cfg(test)]
    injected_failures: u32,
}

impl Resampler {
    pub fn new() -> Self {
        Self {
            context: None,
            reinit_count: 0,
            #[cfg(test)]
            injected_failures: 0,
        }
    }

    /// How many times a conversion context has been built.
    pub fn reinit_count(&self) -> u64 {
        self.reinit_count
    }

    /// Converts `frame` to `output`.
    ///
    /// A frame already in `output` is returned untouched. The first frame
    /// after a context rebuild is padded with leading silence up to
    /// `ceil(in_samples * out_rate / in_rate)` so the converter warm-up does
    /// not shift sample counts downstream.
    pub fn resample(&mut self, frame: AudioFrame, output: AudioFormat) -> Result<AudioFrame> {
        let input = frame.format();
        if input == output {
            return Ok(frame);
        }

        let stale = self
            .context
            .as_ref()
            .is_none_or(|c| c.input != input || c.output != output);
        if stale {
            self.rebuild(input, output)?;
        }

        match self.convert(&frame) {
            Ok(converted) => Ok(converted),
            Err(first) => {
                warn!("Resampler {} -> {} failed ({}), reinitializing", input, output, first);
                self.rebuild(input, output)?;
                self.convert(&frame).map_err(|second| {
                    PipelineError::Invariant(format!(
                        "Resampler {input} -> {output} failed after two reinitializations: {second}"
                    ))
                })
            }
        }
    }

    fn rebuild(&mut self, input: AudioFormat, output: AudioFormat) -> Result<()> {
        if !input.is_valid() || !output.is_valid() {
            return Err(PipelineError::Configuration(format!(
                "Unsupported conversion {input} -> {output}"
            )));
        }

        let rate = if input.sample_rate != output.sample_rate {
            Some(RateConverter::new(
                input.sample_rate,
                output.sample_rate,
                output.channels as usize,
            )?)
        } else {
            None
        };

        self.reinit_count += 1;
        info!(
            "Resampler initialized {} -> {} (init #{})",
            input, output, self.reinit_count
        );
        self.context = Some(Context {
            input,
            output,
            rate,
            first_frame: true,
        });
        Ok(())
    }

    fn convert(&mut self, frame: &AudioFrame) -> Result<AudioFrame> {
        #[cfg(test)]
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(PipelineError::Configuration("injected failure".into()));
        }

        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| PipelineError::Invariant("Resampler used without context".into()))?;
        let (input, output) = (ctx.input, ctx.output);
        let in_frames = frame.samples_per_channel();

        let planar = remix(
            &frame.samples().to_f64(),
            input.channels as usize,
            output.channels as usize,
        );
        let planar = match ctx.rate.as_mut() {
            Some(rate) => rate.process(planar)?,
            None => planar,
        };
        let produced = planar.first().map_or(0, Vec::len);

        let mut samples = Samples::from_f64(output.sample_format, &interleave(&planar));
        if ctx.first_frame {
            ctx.first_frame = false;
            let expected = (in_frames as u64 * output.sample_rate as u64)
                .div_ceil(input.sample_rate as u64) as usize;
            if produced < expected {
                let deficit = expected - produced;
                debug!("Padding first resampled frame with {} samples of silence", deficit);
                samples.prepend_silence(deficit * output.channels as usize);
            }
        }

        let pts = frame.pts * output.sample_rate as u64 / input.sample_rate as u64;
        let mut converted = AudioFrame::new(output, samples, pts)?;
        converted.voice = frame.voice;
        Ok(converted)
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

/// De-interleaves to planar, mapping `in_ch` channels onto `out_ch`.
///
/// Down-mixing to mono averages; otherwise output channel `c` reads input
/// channel `c % in_ch`.
fn remix(interleaved: &[f64], in_ch: usize, out_ch: usize) -> Vec<Vec<f64>> {
    let frames = interleaved.len() / in_ch;
    let mut planar = vec![Vec::with_capacity(frames); out_ch];
    for frame in interleaved.chunks_exact(in_ch) {
        if out_ch == 1 && in_ch > 1 {
            planar[0].push(frame.iter().sum::<f64>() / in_ch as f64);
        } else {
            for (ch, out) in planar.iter_mut().enumerate() {
                out.push(frame[ch % in_ch]);
            }
        }
    }
    planar
}

fn interleave(planar: &[Vec<f64>]) -> Vec<f64> {
    let frames = planar.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(frames * planar.len());
    for i in 0..frames {
        for channel in planar {
            out.push(channel[i]);
        }
    }
    out
}
