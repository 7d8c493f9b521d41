//! Capture sources and the backend that opens them.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::audio::format::AudioFormat;
use crate::audio::frame::{AudioFrame, Samples};
use crate::audio::ring_buffer::RingBuffer;
use crate::error::{PipelineError, Result};
use crate::io::file::FileSource;

/// Frames of backlog a device reader keeps before dropping the oldest.
const MAX_DEVICE_BACKLOG_FRAMES: usize = 3;

pub const FILE_SCHEME: &str = "file://";

/// What a capture source reports once opened.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceParams {
    pub name: String,
    pub format: AudioFormat,
    /// Samples per channel the source produces per read.
    pub frame_size: usize,
}

impl Default for DeviceParams {
    fn default() -> Self {
        let format = AudioFormat::default();
        Self {
            name: "default".to_string(),
            format,
            frame_size: format.samples_for(std::time::Duration::from_millis(20)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputResource {
    /// The default capture device.
    Default,
    Device(String),
    File(PathBuf),
}

impl InputResource {
    /// `""` is the default device, `file://<path>` a media file, anything
    /// else a device name.
    pub fn parse(resource: &str) -> Self {
        if resource.is_empty() {
            InputResource::Default
        } else if let Some(path) = resource.strip_prefix(FILE_SCHEME) {
            InputResource::File(PathBuf::from(path))
        } else {
            InputResource::Device(resource.to_string())
        }
    }
}

pub trait MediaSource: Send {
    fn params(&self) -> DeviceParams;

    /// Reads about `samples_per_channel` samples in the source's own format.
    /// `Ok(None)` means nothing is ready yet.
    fn read(&mut self, samples_per_channel: usize) -> Result<Option<AudioFrame>>;
}

pub trait CaptureBackend: Send + Sync {
    fn open(&self, resource: &InputResource) -> Result<Box<dyn MediaSource>>;
}

/// Reader on the shared device ring buffer.
pub struct DeviceSource {
    ring: Arc<RingBuffer>,
    reader: String,
    name: String,
}

impl DeviceSource {
    pub fn new(ring: Arc<RingBuffer>, reader: String, name: String) -> Result<Self> {
        ring.create_read_offset(&reader)?;
        Ok(Self { ring, reader, name })
    }
}

impl MediaSource for DeviceSource {
    fn params(&self) -> DeviceParams {
        DeviceParams {
            name: self.name.clone(),
            format: self.ring.format(),
            frame_size: self.ring.frame_size(),
        }
    }

    fn read(&mut self, samples_per_channel: usize) -> Result<Option<AudioFrame>> {
        let limit = samples_per_channel.max(self.ring.frame_size()) * MAX_DEVICE_BACKLOG_FRAMES;
        let available = self.ring.available_for_get(&self.reader);
        if available > limit {
            let dropped = self.ring.discard(available - limit, &self.reader);
            debug!("Device reader '{}' dropped {} stale samples", self.reader, dropped);
        }

        let format = self.ring.format();
        let mut samples = Samples::empty(format.sample_format);
        let mut pts = None;
        while samples.len() < samples_per_channel * format.channels as usize {
            let Some(frame) = self.ring.get(&self.reader) else {
                break;
            };
            pts.get_or_insert(frame.pts);
            samples.extend_from(frame.samples());
        }
        match pts {
            Some(pts) => Ok(Some(AudioFrame::new(format, samples, pts)?)),
            None => Ok(None),
        }
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.ring.remove_read_offset(&self.reader);
    }
}

/// Opens the runtime's shared capture device and media files.
pub struct RuntimeBackend {
    device_ring: Arc<RingBuffer>,
    device_name: String,
    next_reader: AtomicU64,
}

impl RuntimeBackend {
    pub fn new(device_ring: Arc<RingBuffer>, device_name: impl Into<String>) -> Self {
        Self {
            device_ring,
            device_name: device_name.into(),
            next_reader: AtomicU64::new(0),
        }
    }

    fn open_device(&self) -> Result<Box<dyn MediaSource>> {
        let reader = format!(
            "capture-{}",
            self.next_reader.fetch_add(1, Ordering::Relaxed)
        );
        let source = DeviceSource::new(self.device_ring.clone(), reader, self.device_name.clone())?;
        Ok(Box::new(source))
    }
}

impl CaptureBackend for RuntimeBackend {
    fn open(&self, resource: &InputResource) -> Result<Box<dyn MediaSource>> {
        match resource {
            InputResource::Default => self.open_device(),
            InputResource::Device(name) if *name == self.device_name => self.open_device(),
            InputResource::Device(name) => Err(PipelineError::ResourceUnavailable(format!(
                "Unknown capture device '{name}'"
            ))),
            InputResource::File(path) => Ok(Box::new(FileSource::open(path)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_ring() -> Arc<RingBuffer> {
        Arc::new(RingBuffer::new("device", AudioFormat::mono(8000), 16, 160))
    }

    #[test]
    fn test_parse_resource() {
        assert_eq!(InputResource::parse(""), InputResource::Default);
        assert_eq!(
            InputResource::parse("file:///tmp/a.wav"),
            InputResource::File(PathBuf::from("/tmp/a.wav"))
        );
        assert_eq!(InputResource::parse("mic"), InputResource::Device("mic".into()));
    }

    #[test]
    fn test_device_source_reads_ring() {
        let ring = device_ring();
        let backend = RuntimeBackend::new(ring.clone(), "default");
        let mut source = backend.open(&InputResource::Default).unwrap();
        assert_eq!(ring.reader_count(), 1);
        assert!(source.read(160).unwrap().is_none());

        ring.put(AudioFrame::from_i16(8000, 1, vec![5; 320]).unwrap()).unwrap();
        let frame = source.read(160).unwrap().unwrap();
        assert_eq!(frame.samples_per_channel(), 160);
        assert_eq!(source.params().format, AudioFormat::mono(8000));

        drop(source);
        assert_eq!(ring.reader_count(), 0);
    }

    #[test]
    fn test_device_source_drops_backlog() {
        let ring = device_ring();
        let backend = RuntimeBackend::new(ring.clone(), "default");
        let mut source = backend.open(&InputResource::Default).unwrap();
        for i in 0..10 {
            ring.put(AudioFrame::from_i16(8000, 1, vec![i; 160]).unwrap()).unwrap();
        }
        let frame = source.read(160).unwrap().unwrap();
        assert_eq!(frame.samples().to_i16()[0], 7);
    }

    #[test]
    fn test_unknown_device_is_unavailable() {
        let backend = RuntimeBackend::new(device_ring(), "default");
        let err = backend.open(&InputResource::Device("usb".into())).err().unwrap();
        assert!(matches!(err, PipelineError::ResourceUnavailable(_)));
        assert!(backend.open(&InputResource::Device("default".into())).is_ok());
    }
}
