//! Multi-reader circular frame store.
//!
//! One producer writes; any number of named readers consume independently,
//! each with its own cursor. Cursors are absolute frame counts, so for every
//! reader `0 <= write_pos - read_pos <= capacity` holds. When the writer
//! laps a reader, the reader loses its oldest frame rather than blocking the
//! writer.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::audio::format::AudioFormat;
use crate::audio::frame::AudioFrame;
use crate::audio::resampler::Resampler;
use crate::audio::resizer::AudioFrameResizer;
use crate::error::{PipelineError, Result};

/// Invoked with every frame stored after the reader was registered.
pub type PushCallback = Arc<dyn Fn(&Arc<AudioFrame>) + Send + Sync>;

struct ReadOffset {
    pos: u64,
    callback: Option<PushCallback>,
}

struct Storage {
    slots: Vec<Option<Arc<AudioFrame>>>,
    write_pos: u64,
    readers: HashMap<String, ReadOffset>,
    overruns: u64,
}

/// Producer-side normalization, only touched from `put`.
struct Normalizer {
    resampler: Resampler,
    resizer: AudioFrameResizer,
}

pub struct RingBuffer {
    id: String,
    format: AudioFormat,
    frame_size: usize,
    capacity: usize,
    storage: Mutex<Storage>,
    data_available: Condvar,
    normalizer: Mutex<Normalizer>,
}

impl RingBuffer {
    /// Creates a buffer of `capacity` frames, each `frame_size` samples per
    /// channel in `format`.
    pub fn new(id: impl Into<String>, format: AudioFormat, capacity: usize, frame_size: usize) -> Self {
        let id = id.into();
        let capacity = capacity.max(1);
        debug!(
            "Ring buffer '{}' created: {} frames of {} samples, {}",
            id, capacity, frame_size, format
        );
        Self {
            id,
            format,
            frame_size,
            capacity,
            storage: Mutex::new(Storage {
                slots: vec![None; capacity],
                write_pos: 0,
                readers: HashMap::new(),
                overruns: 0,
            }),
            data_available: Condvar::new(),
            normalizer: Mutex::new(Normalizer {
                resampler: Resampler::new(),
                resizer: AudioFrameResizer::without_callback(format, frame_size),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames that were overwritten before some reader consumed them.
    pub fn overrun_count(&self) -> u64 {
        self.storage.lock().unwrap().overruns
    }

    pub fn reader_count(&self) -> usize {
        self.storage.lock().unwrap().readers.len()
    }

    pub fn has_reader(&self, reader: &str) -> bool {
        self.storage.lock().unwrap().readers.contains_key(reader)
    }

    /// Stores `frame`, converting it to the buffer format and cutting it into
    /// `frame_size` frames first. Never blocks on readers.
    pub fn put(&self, frame: AudioFrame) -> Result<()> {
        let frames: Vec<Arc<AudioFrame>> = {
            let mut normalizer = self.normalizer.lock().unwrap();
            let converted = normalizer.resampler.resample(frame, self.format)?;
            normalizer.resizer.enqueue(converted)?;
            std::iter::from_fn(|| normalizer.resizer.dequeue())
                .map(Arc::new)
                .collect()
        };
        if frames.is_empty() {
            return Ok(());
        }

        let callbacks: Vec<PushCallback> = {
            let mut storage = self.storage.lock().unwrap();
            for frame in &frames {
                self.store(&mut storage, frame.clone());
            }
            storage
                .readers
                .values()
                .filter_map(|r| r.callback.clone())
                .collect()
        };
        self.data_available.notify_all();

        for callback in callbacks {
            for frame in &frames {
                callback(frame);
            }
        }
        Ok(())
    }

    fn store(&self, storage: &mut Storage, frame: Arc<AudioFrame>) {
        let write_pos = storage.write_pos;
        let capacity = self.capacity as u64;
        let mut overrun = 0;
        for (name, reader) in storage.readers.iter_mut() {
            if write_pos - reader.pos >= capacity {
                reader.pos += 1;
                overrun += 1;
                trace!("Ring buffer '{}' overran reader '{}'", self.id, name);
            }
        }
        if overrun > 0 {
            storage.overruns += overrun;
            debug!(
                "Ring buffer '{}' full, dropped oldest frame for {} reader(s)",
                self.id, overrun
            );
        }
        let slot = (write_pos % capacity) as usize;
        storage.slots[slot] = Some(frame);
        storage.write_pos += 1;
    }

    /// Registers a reader positioned at the current write position.
    pub fn create_read_offset(&self, reader: &str) -> Result<()> {
        self.register(reader, None)
    }

    /// Registers a reader that is also pushed every new frame.
    pub fn create_read_offset_with_callback(&self, reader: &str, callback: PushCallback) -> Result<()> {
        self.register(reader, Some(callback))
    }

    fn register(&self, reader: &str, callback: Option<PushCallback>) -> Result<()> {
        let mut storage = self.storage.lock().unwrap();
        if storage.readers.contains_key(reader) {
            return Err(PipelineError::Invariant(format!(
                "Reader '{}' already registered on ring buffer '{}'",
                reader, self.id
            )));
        }
        let pos = storage.write_pos;
        storage
            .readers
            .insert(reader.to_string(), ReadOffset { pos, callback });
        debug!("Ring buffer '{}' reader '{}' added at {}", self.id, reader, pos);
        Ok(())
    }

    pub fn remove_read_offset(&self, reader: &str) {
        let removed = self.storage.lock().unwrap().readers.remove(reader).is_some();
        if removed {
            debug!("Ring buffer '{}' reader '{}' removed", self.id, reader);
            // wake waiters on this reader
            self.data_available.notify_all();
        }
    }

    /// Next unread frame for `reader`, without blocking.
    pub fn get(&self, reader: &str) -> Option<Arc<AudioFrame>> {
        let mut storage = self.storage.lock().unwrap();
        let write_pos = storage.write_pos;
        let Some(offset) = storage.readers.get_mut(reader) else {
            warn!("Ring buffer '{}': get for unknown reader '{}'", self.id, reader);
            return None;
        };
        if offset.pos >= write_pos {
            return None;
        }
        let slot = (offset.pos % self.capacity as u64) as usize;
        offset.pos += 1;
        storage.slots[slot].clone()
    }

    /// Unread samples per channel for `reader`.
    pub fn available_for_get(&self, reader: &str) -> usize {
        let storage = self.storage.lock().unwrap();
        match self.available_locked(&storage, reader) {
            Some(n) => n,
            None => {
                warn!("Ring buffer '{}': unknown reader '{}'", self.id, reader);
                0
            }
        }
    }

    fn available_locked(&self, storage: &Storage, reader: &str) -> Option<usize> {
        storage
            .readers
            .get(reader)
            .map(|r| (storage.write_pos - r.pos) as usize * self.frame_size)
    }

    /// Blocks until `reader` has at least `min_samples` samples per channel,
    /// the reader is removed, or `deadline` passes. Returns what is available.
    pub fn wait_for_data_available(&self, reader: &str, min_samples: usize, deadline: Instant) -> usize {
        let mut storage = self.storage.lock().unwrap();
        loop {
            let Some(available) = self.available_locked(&storage, reader) else {
                return 0;
            };
            if available >= min_samples {
                return available;
            }
            let now = Instant::now();
            if now >= deadline {
                return available;
            }
            storage = self
                .data_available
                .wait_timeout(storage, deadline - now)
                .unwrap()
                .0;
        }
    }

    /// Drops whole frames covering `samples` samples per channel for `reader`,
    /// capped at what is available. Returns the number of samples dropped.
    pub fn discard(&self, samples: usize, reader: &str) -> usize {
        let mut storage = self.storage.lock().unwrap();
        let write_pos = storage.write_pos;
        let Some(offset) = storage.readers.get_mut(reader) else {
            warn!("Ring buffer '{}': discard for unknown reader '{}'", self.id, reader);
            return 0;
        };
        let wanted = samples.div_ceil(self.frame_size.max(1)) as u64;
        let frames = wanted.min(write_pos - offset.pos);
        offset.pos += frames;
        frames as usize * self.frame_size
    }

    /// Skips `reader` to the write position.
    pub fn flush(&self, reader: &str) {
        let mut storage = self.storage.lock().unwrap();
        let write_pos = storage.write_pos;
        match storage.readers.get_mut(reader) {
            Some(offset) => offset.pos = write_pos,
            None => warn!("Ring buffer '{}': flush for unknown reader '{}'", self.id, reader),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn ring(capacity: usize) -> RingBuffer {
        RingBuffer::new("test", AudioFormat::mono(8000), capacity, 160)
    }

    fn frame(value: i16) -> AudioFrame {
        AudioFrame::from_i16(8000, 1, vec![value; 160]).unwrap()
    }

    fn first_sample(frame: &AudioFrame) -> i16 {
        frame.samples().to_i16()[0]
    }

    #[test]
    fn test_readers_consume_independently() {
        let ring = ring(16);
        ring.create_read_offset("a").unwrap();
        ring.create_read_offset("b").unwrap();
        for i in 0..3 {
            ring.put(frame(i)).unwrap();
        }

        for _ in 0..2 {
            assert!(ring.get("a").is_some());
        }
        for _ in 0..3 {
            assert!(ring.get("b").is_some());
        }

        assert_eq!(ring.available_for_get("a"), 160);
        assert_eq!(ring.available_for_get("b"), 0);
        assert!(ring.get("b").is_none());
    }

    #[test]
    fn test_reader_sees_ordered_frames() {
        let ring = ring(8);
        ring.create_read_offset("r").unwrap();
        for i in 1..=5 {
            ring.put(frame(i * 100)).unwrap();
        }
        let got: Vec<i16> = std::iter::from_fn(|| ring.get("r"))
            .map(|f| first_sample(&f))
            .collect();
        assert_eq!(got, vec![100, 200, 300, 400, 500]);
    }

    #[test]
    fn test_put_normalizes_size_and_format() {
        let ring = ring(8);
        ring.create_read_offset("r").unwrap();
        ring.put(AudioFrame::from_i16(8000, 1, vec![1; 100]).unwrap()).unwrap();
        assert_eq!(ring.available_for_get("r"), 0);
        ring.put(AudioFrame::from_i16(8000, 1, vec![1; 100]).unwrap()).unwrap();
        assert_eq!(ring.available_for_get("r"), 160);

        let stereo = AudioFrame::from_i16(8000, 2, vec![1000; 320]).unwrap();
        ring.put(stereo).unwrap();
        let f = ring.get("r").unwrap();
        assert_eq!(f.format(), AudioFormat::mono(8000));
        assert_eq!(f.samples_per_channel(), 160);
    }

    #[test]
    fn test_overrun_drops_oldest_for_slow_reader() {
        let ring = ring(4);
        ring.create_read_offset("slow").unwrap();
        for i in 0..6 {
            ring.put(frame(i)).unwrap();
        }
        assert_eq!(ring.overrun_count(), 2);
        assert_eq!(ring.available_for_get("slow"), 4 * 160);
        let got: Vec<i16> = std::iter::from_fn(|| ring.get("slow"))
            .map(|f| first_sample(&f))
            .collect();
        assert_eq!(got, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_recreated_reader_starts_at_write_position() {
        let ring = ring(4);
        ring.create_read_offset("r").unwrap();
        for i in 0..3 {
            ring.put(frame(i)).unwrap();
        }
        ring.remove_read_offset("r");
        ring.create_read_offset("r").unwrap();
        assert_eq!(ring.available_for_get("r"), 0);
        ring.put(frame(9)).unwrap();
        assert_eq!(first_sample(&ring.get("r").unwrap()), 9);
    }

    #[test]
    fn test_duplicate_reader_is_invariant_violation() {
        let ring = ring(4);
        ring.create_read_offset("r").unwrap();
        let err = ring.create_read_offset("r").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ring.reader_count(), 1);
    }

    #[test]
    fn test_unknown_reader_is_noop() {
        let ring = ring(4);
        ring.put(frame(1)).unwrap();
        assert!(ring.get("ghost").is_none());
        assert_eq!(ring.available_for_get("ghost"), 0);
        assert_eq!(ring.discard(160, "ghost"), 0);
    }

    #[test]
    fn test_discard_drops_whole_frames_capped_at_available() {
        let ring = ring(8);
        ring.create_read_offset("r").unwrap();
        for i in 0..3 {
            ring.put(frame(i)).unwrap();
        }
        assert_eq!(ring.discard(200, "r"), 320);
        assert_eq!(first_sample(&ring.get("r").unwrap()), 2);
        assert_eq!(ring.discard(1000, "r"), 0);
    }

    #[test]
    fn test_flush_skips_to_write_position() {
        let ring = ring(8);
        ring.create_read_offset("r").unwrap();
        ring.put(frame(1)).unwrap();
        ring.flush("r");
        assert_eq!(ring.available_for_get("r"), 0);
    }

    #[test]
    fn test_wait_for_data_wakes_on_put() {
        let ring = Arc::new(ring(8));
        ring.create_read_offset("r").unwrap();

        let writer = ring.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.put(frame(7)).unwrap();
        });

        let available =
            ring.wait_for_data_available("r", 160, Instant::now() + Duration::from_secs(5));
        assert_eq!(available, 160);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_data_returns_at_deadline() {
        let ring = ring(8);
        ring.create_read_offset("r").unwrap();
        let start = Instant::now();
        let available =
            ring.wait_for_data_available("r", 160, start + Duration::from_millis(30));
        assert_eq!(available, 0);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_push_callback_runs_outside_lock() {
        let ring = Arc::new(ring(8));
        let seen = Arc::new(AtomicUsize::new(0));

        let inner = ring.clone();
        let counter = seen.clone();
        ring.create_read_offset_with_callback(
            "pushed",
            Arc::new(move |_frame: &Arc<AudioFrame>| {
                // re-entering the buffer must not deadlock
                inner.available_for_get("pushed");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        ring.put(AudioFrame::from_i16(8000, 1, vec![0; 480]).unwrap()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_readers_see_gap_free_sequence() {
        const FRAMES: i16 = 400;
        let ring = Arc::new(ring(512));
        let readers = ["a", "b", "c", "d"];
        for reader in readers {
            ring.create_read_offset(reader).unwrap();
        }

        let handles: Vec<_> = readers
            .iter()
            .enumerate()
            .map(|(n, reader)| {
                let ring = ring.clone();
                let reader = reader.to_string();
                // each reader discards at its own pace
                let discard_every = 3 + n;
                thread::spawn(move || {
                    let mut expected = 1i16;
                    let mut seen = Vec::new();
                    let mut ops = 0;
                    let deadline = Instant::now() + Duration::from_secs(10);
                    while expected <= FRAMES && Instant::now() < deadline {
                        let wait_until = Instant::now() + Duration::from_millis(20);
                        if ring.wait_for_data_available(&reader, 160, wait_until) == 0 {
                            continue;
                        }
                        ops += 1;
                        if ops % discard_every == 0 {
                            expected += (ring.discard(160, &reader) / 160) as i16;
                        } else if let Some(frame) = ring.get(&reader) {
                            assert_eq!(first_sample(&frame), expected, "reader {reader}");
                            seen.push(expected);
                            expected += 1;
                        }
                    }
                    (expected, seen)
                })
            })
            .collect();

        let writer = {
            let ring = ring.clone();
            thread::spawn(move || {
                for i in 1..=FRAMES {
                    ring.put(frame(i)).unwrap();
                    if i % 50 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };
        writer.join().unwrap();

        for handle in handles {
            let (expected, seen) = handle.join().unwrap();
            assert_eq!(expected, FRAMES + 1);
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            assert!(!seen.is_empty());
        }
        assert_eq!(ring.overrun_count(), 0);
    }
}
