//! FIFO that turns arbitrary-length runs of samples into fixed-size frames.

use tracing::{debug, trace};

use crate::audio::format::AudioFormat;
use crate::audio::frame::{AudioFrame, Samples};
use crate::error::{PipelineError, Result};

pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send>;

/// Accumulates samples of one format and emits frames of exactly
/// `frame_size` samples per channel.
///
/// With a callback, every complete frame is handed to it during
/// [`enqueue`](Self::enqueue). Without one, frames are taken with
/// [`dequeue`](Self::dequeue).
pub struct AudioFrameResizer {
    format: AudioFormat,
    frame_size: usize,
    queue: Samples,
    next_pts: u64,
    /// Voice flag of the latest input, carried onto emitted frames.
    voice: bool,
    callback: Option<FrameCallback>,
}

impl AudioFrameResizer {
    pub fn new(
        format: AudioFormat,
        frame_size: usize,
        callback: impl FnMut(AudioFrame) + Send + 'static,
    ) -> Self {
        let mut resizer = Self::without_callback(format, frame_size);
        resizer.callback = Some(Box::new(callback));
        resizer
    }

    /// Pull-mode resizer.
    pub fn without_callback(format: AudioFormat, frame_size: usize) -> Self {
        Self {
            format,
            frame_size,
            queue: Samples::empty(format.sample_format),
            next_pts: 0,
            voice: false,
            callback: None,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Queued samples per channel.
    pub fn queued_samples(&self) -> usize {
        self.queue.len() / self.format.channels.max(1) as usize
    }

    /// Changes the accepted format. Queued samples are discarded.
    pub fn set_format(&mut self, format: AudioFormat) {
        if format != self.format {
            debug!("Resizer format {} -> {}", self.format, format);
        }
        self.format = format;
        self.reset();
    }

    /// Changes the emitted frame size. Queued samples are discarded.
    pub fn set_frame_size(&mut self, frame_size: usize) {
        if frame_size != self.frame_size {
            debug!("Resizer frame size {} -> {}", self.frame_size, frame_size);
        }
        self.frame_size = frame_size;
        self.reset();
    }

    fn reset(&mut self) {
        if !self.queue.is_empty() {
            trace!("Resizer dropping {} queued samples", self.queue.len());
        }
        self.queue = Samples::empty(self.format.sample_format);
    }

    /// Appends `frame`; in callback mode emits every complete frame.
    pub fn enqueue(&mut self, frame: AudioFrame) -> Result<()> {
        if frame.format() != self.format {
            return Err(PipelineError::Configuration(format!(
                "Resizer expects {}, got {}",
                self.format,
                frame.format()
            )));
        }
        if self.frame_size == 0 {
            return Err(PipelineError::Configuration(
                "Resizer frame size must be positive".into(),
            ));
        }

        self.voice = frame.voice;
        self.queue.extend_from(frame.samples());

        if self.callback.is_some() {
            while let Some(out) = self.dequeue() {
                if let Some(callback) = self.callback.as_mut() {
                    callback(out);
                }
            }
        }
        Ok(())
    }

    /// Takes one complete frame if enough samples are queued.
    pub fn dequeue(&mut self) -> Option<AudioFrame> {
        let channels = self.format.channels as usize;
        let frame_len = self.frame_size * channels;
        if frame_len == 0 || self.queue.len() < frame_len {
            return None;
        }

        let samples = self.queue.drain_front(frame_len);
        let pts = self.next_pts;
        self.next_pts += self.frame_size as u64;
        let mut frame = AudioFrame::new(self.format, samples, pts).ok()?;
        frame.voice = self.voice;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn collecting(frame_size: usize) -> (AudioFrameResizer, Arc<Mutex<Vec<AudioFrame>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        let resizer = AudioFrameResizer::new(AudioFormat::mono(8000), frame_size, move |f| {
            sink.lock().unwrap().push(f)
        });
        (resizer, out)
    }

    #[test]
    fn test_emits_fixed_frames_and_keeps_remainder() {
        let (mut resizer, out) = collecting(160);
        let data: Vec<i16> = (0..350).map(|i| i as i16).collect();
        resizer
            .enqueue(AudioFrame::from_i16(8000, 1, data).unwrap())
            .unwrap();

        let frames = out.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.samples_per_channel() == 160));
        assert_eq!(resizer.queued_samples(), 30);
        assert_eq!(frames[1].pts, 160);
        assert_eq!(frames[1].samples().to_i16()[0], 160);
    }

    #[test]
    fn test_samples_are_conserved_across_enqueues() {
        let (mut resizer, out) = collecting(160);
        let sizes = [1usize, 99, 160, 161, 480, 7, 300];
        let mut next = 0i16;
        for size in sizes {
            let data: Vec<i16> = (0..size)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();
            resizer
                .enqueue(AudioFrame::from_i16(8000, 1, data).unwrap())
                .unwrap();
        }

        let frames = out.lock().unwrap();
        let total: usize = sizes.iter().sum();
        let emitted: usize = frames.iter().map(|f| f.samples_per_channel()).sum();
        assert_eq!(emitted + resizer.queued_samples(), total);

        let flat: Vec<i16> = frames.iter().flat_map(|f| f.samples().to_i16()).collect();
        assert!(flat.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));
    }

    #[test]
    fn test_format_mismatch_is_rejected() {
        let (mut resizer, _out) = collecting(160);
        let err = resizer
            .enqueue(AudioFrame::from_i16(16000, 1, vec![0; 320]).unwrap())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_reconfiguration_discards_remainder() {
        let mut resizer = AudioFrameResizer::without_callback(AudioFormat::mono(8000), 160);
        resizer
            .enqueue(AudioFrame::from_i16(8000, 1, vec![1; 200]).unwrap())
            .unwrap();
        assert!(resizer.dequeue().is_some());
        assert_eq!(resizer.queued_samples(), 40);

        resizer.set_frame_size(80);
        assert_eq!(resizer.queued_samples(), 0);
        assert!(resizer.dequeue().is_none());

        resizer
            .enqueue(AudioFrame::from_i16(8000, 1, vec![1; 100]).unwrap())
            .unwrap();
        resizer.set_format(AudioFormat::stereo(8000));
        assert_eq!(resizer.queued_samples(), 0);
    }
}
