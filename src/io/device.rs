//! Audio device I/O using cpal.
//!
//! - [`DeviceCapture`] feeds the default input device into a ring buffer
//! - [`DevicePlayback`] drains a ring buffer reader to the default output
//!
//! cpal streams are not `Send` on every platform, so each stream is built,
//! played and dropped on a dedicated thread.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat as CpalSampleFormat, SampleRate, StreamConfig};
use crossbeam::channel::{self, Sender};
use dasp_sample::{FromSample, Sample as DaspSample};
use tracing::{debug, error, info, warn};

use crate::audio::format::{AudioFormat, SampleFormat};
use crate::audio::frame::AudioFrame;
use crate::audio::ring_buffer::RingBuffer;
use crate::error::{PipelineError, Result};
use crate::io::source::DeviceParams;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

fn unavailable(e: anyhow::Error) -> PipelineError {
    PipelineError::ResourceUnavailable(format!("{e:#}"))
}

/// Keeps a cpal stream alive on its own thread until dropped.
struct StreamThread {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Runs `build` on a new thread and waits for it to report the stream's
    /// parameters.
    fn spawn<F>(name: &str, build: F) -> Result<(Self, DeviceParams)>
    where
        F: FnOnce() -> anyhow::Result<(cpal::Stream, DeviceParams)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match build() {
                Ok((stream, params)) => {
                    let _ = ready_tx.send(Ok(params));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let params = ready_rx
            .recv_timeout(STARTUP_TIMEOUT)
            .map_err(|_| PipelineError::Timeout(STARTUP_TIMEOUT))?
            .map_err(unavailable)?;

        Ok((
            Self {
                stop: Some(stop_tx),
                handle: Some(handle),
            },
            params,
        ))
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        // closing the channel wakes the thread
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Captures the default input device into a ring buffer.
pub struct DeviceCapture {
    params: DeviceParams,
    _stream: StreamThread,
}

impl DeviceCapture {
    pub fn start(ring: Arc<RingBuffer>) -> Result<Self> {
        let (stream, params) = StreamThread::spawn("device-capture", move || build_capture(ring))?;
        info!("Capturing from '{}' at {}", params.name, params.format);
        Ok(Self {
            params,
            _stream: stream,
        })
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }
}

fn build_capture(ring: Arc<RingBuffer>) -> anyhow::Result<(cpal::Stream, DeviceParams)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("No default input device available")?;
    let name = device.name().unwrap_or_else(|_| "default".to_string());
    let supported = device
        .default_input_config()
        .context("Failed to query input config")?;
    debug!("Input config: {supported:#?}");

    let config: StreamConfig = supported.config();
    let rate = config.sample_rate.0;
    let channels = config.channels;
    let on_error =
        |err: cpal::StreamError| error!("An error occurred on the input audio stream: {}", err);

    let (stream, sample_format) = match supported.sample_format() {
        CpalSampleFormat::F32 => {
            let ring = ring.clone();
            let stream = device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    push_captured(&ring, AudioFrame::from_f32(rate, channels, data.to_vec()));
                },
                on_error,
                None,
            )?;
            (stream, SampleFormat::F32)
        }
        CpalSampleFormat::I16 => {
            let ring = ring.clone();
            let stream = device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    push_captured(&ring, AudioFrame::from_i16(rate, channels, data.to_vec()));
                },
                on_error,
                None,
            )?;
            (stream, SampleFormat::S16)
        }
        CpalSampleFormat::U16 => (
            build_converted_input::<u16>(&device, &config, ring.clone(), on_error)?,
            SampleFormat::F32,
        ),
        CpalSampleFormat::I32 => (
            build_converted_input::<i32>(&device, &config, ring.clone(), on_error)?,
            SampleFormat::F32,
        ),
        other => return Err(anyhow!("Unsupported input sample format {other:?}")),
    };
    stream.play().context("Failed to start input stream")?;

    let format = AudioFormat::new(rate, channels, sample_format);
    Ok((
        stream,
        DeviceParams {
            name,
            format,
            frame_size: ring.frame_size(),
        },
    ))
}

/// Input stream for sample types the ring buffer does not store natively.
fn build_converted_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: Arc<RingBuffer>,
    on_error: impl FnMut(cpal::StreamError) + Send + 'static,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::SizedSample,
    f32: FromSample<T>,
{
    let rate = config.sample_rate.0;
    let channels = config.channels;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let samples: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
            push_captured(&ring, AudioFrame::from_f32(rate, channels, samples));
        },
        on_error,
        None,
    )?;
    Ok(stream)
}

fn push_captured(ring: &RingBuffer, frame: Result<AudioFrame>) {
    match frame.and_then(|f| ring.put(f)) {
        Ok(()) => {}
        Err(e) => warn!("Dropping captured audio: {}", e),
    }
}

/// Plays one ring buffer reader on the default output device, filling gaps
/// with silence.
pub struct DevicePlayback {
    ring: Arc<RingBuffer>,
    reader: String,
    params: DeviceParams,
    _stream: StreamThread,
}

impl DevicePlayback {
    pub fn start(ring: Arc<RingBuffer>, reader: &str) -> Result<Self> {
        ring.create_read_offset(reader)?;
        let source = ring.clone();
        let reader_id = reader.to_string();
        let started = StreamThread::spawn("device-playback", move || build_playback(source, reader_id));
        let (stream, params) = match started {
            Ok(started) => started,
            Err(e) => {
                ring.remove_read_offset(reader);
                return Err(e);
            }
        };
        info!("Playing '{}' on '{}'", reader, params.name);
        Ok(Self {
            ring,
            reader: reader.to_string(),
            params,
            _stream: stream,
        })
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }
}

impl Drop for DevicePlayback {
    fn drop(&mut self) {
        self.ring.remove_read_offset(&self.reader);
    }
}

fn build_playback(ring: Arc<RingBuffer>, reader: String) -> anyhow::Result<(cpal::Stream, DeviceParams)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("No default output device available")?;
    let name = device.name().unwrap_or_else(|_| "default".to_string());

    let format = ring.format();
    let frame_size = ring.frame_size();
    let config = StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            while pending.len() < data.len() {
                match ring.get(&reader) {
                    Some(frame) => pending.extend(frame.samples().to_f32()),
                    None => break,
                }
            }
            let len = pending.len().min(data.len());
            data[..len].copy_from_slice(&pending[..len]);
            data[len..].fill(0.0);
            pending.drain(..len);
        },
        |err| error!("An error occurred on the output audio stream: {}", err),
        None,
    )?;
    stream.play().context("Failed to start output stream")?;

    Ok((
        stream,
        DeviceParams {
            name,
            format: format.with_sample_format(SampleFormat::F32),
            frame_size,
        },
    ))
}
