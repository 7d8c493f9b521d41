//! Per-call capture pump.
//!
//! [`AudioInput`] owns one thread that polls its capture source every frame
//! period, converts what it reads to the requested format, runs the
//! processing chain, cuts the result into fixed-size frames and hands each
//! frame to its observers.
//!
//! Reconfiguration (switching device or file) is sent to the pump over a
//! channel and answered through a [`ParamsFuture`]. A source that cannot be
//! opened never stops the pump: it falls back to the default device, and
//! failing that emits silence at the normal cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::audio::format::AudioFormat;
use crate::audio::frame::AudioFrame;
use crate::audio::processor::AudioProcessor;
use crate::audio::resampler::Resampler;
use crate::audio::resizer::AudioFrameResizer;
use crate::config::{PipelineConfig, ProcessingConfig};
use crate::error::{PipelineError, Result};
use crate::io::source::{CaptureBackend, DeviceParams, InputResource, MediaSource};
use crate::observer::{FrameObserver, Observable, Subscription};

/// Frames the pump may fall behind before it stops catching up.
const MAX_LAG_FRAMES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Running,
    Stopping,
}

enum Command {
    Switch {
        resource: InputResource,
        reply: Sender<DeviceParams>,
    },
    Stop,
}

/// Parameters of the source an input switched to, once the pump opened it.
pub struct ParamsFuture {
    rx: Receiver<DeviceParams>,
}

impl ParamsFuture {
    fn ready(params: DeviceParams) -> Self {
        let (tx, rx) = channel::bounded(1);
        let _ = tx.send(params);
        Self { rx }
    }

    pub fn wait(&self, timeout: Duration) -> Result<DeviceParams> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| PipelineError::Timeout(timeout))
    }

    pub fn try_get(&self) -> Option<DeviceParams> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, Copy)]
struct Target {
    format: AudioFormat,
    frame_size: usize,
}

pub struct AudioInput {
    id: String,
    frame_duration: Duration,
    processing: ProcessingConfig,
    backend: Arc<dyn CaptureBackend>,
    /// Requested output, kept apart from the pump state so consumers can
    /// reconfigure without waiting on the pump.
    target: Mutex<Target>,
    muted: AtomicBool,
    state: Mutex<PumpState>,
    commands: Mutex<Option<Sender<Command>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    observers: Observable,
    device_params: Mutex<DeviceParams>,
    error: Mutex<Option<PipelineError>>,
    frames_emitted: Arc<AtomicU64>,
}

impl AudioInput {
    pub fn new(id: impl Into<String>, config: &PipelineConfig, backend: Arc<dyn CaptureBackend>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            frame_duration: config.frame_duration,
            processing: config.processing.clone(),
            backend,
            target: Mutex::new(Target {
                format: config.call_format,
                frame_size: config.call_frame_size(),
            }),
            muted: AtomicBool::new(false),
            state: Mutex::new(PumpState::Idle),
            commands: Mutex::new(None),
            pump: Mutex::new(None),
            observers: Observable::new(),
            device_params: Mutex::new(DeviceParams::default()),
            error: Mutex::new(None),
            frames_emitted: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opens `resource` (`""` for the default device, `file://<path>` for a
    /// media file), starting the pump if it is idle.
    pub fn switch_input(self: &Arc<Self>, resource: &str) -> ParamsFuture {
        let resource = InputResource::parse(resource);
        let commands = match self.ensure_pump() {
            Ok(commands) => commands,
            Err(e) => {
                error!("Audio input '{}' cannot start: {}", self.id, e);
                return ParamsFuture::ready(DeviceParams::default());
            }
        };

        let (reply, rx) = channel::bounded(1);
        if commands.send(Command::Switch { resource, reply }).is_err() {
            warn!("Audio input '{}' pump exited before switching", self.id);
            return ParamsFuture::ready(DeviceParams::default());
        }
        ParamsFuture { rx }
    }

    fn ensure_pump(self: &Arc<Self>) -> Result<Sender<Command>> {
        let mut state = self.state.lock().unwrap();
        let mut commands = self.commands.lock().unwrap();
        match *state {
            PumpState::Running => {
                if let Some(tx) = commands.as_ref() {
                    return Ok(tx.clone());
                }
            }
            PumpState::Stopping => {
                return Err(PipelineError::InvalidState(format!(
                    "Audio input '{}' is stopping",
                    self.id
                )));
            }
            PumpState::Idle => {}
        }

        let (tx, rx) = channel::unbounded();
        let pump = Pump::new(self);
        let weak = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name(format!("audio-input-{}", self.id))
            .spawn(move || pump.run(weak, rx))?;

        *self.pump.lock().unwrap() = Some(handle);
        *commands = Some(tx.clone());
        *state = PumpState::Running;
        info!("Audio input '{}' started", self.id);
        Ok(tx)
    }

    /// Stops the pump and waits for it to exit. Idempotent.
    pub fn stop(&self) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            if *state != PumpState::Running {
                return;
            }
            *state = PumpState::Stopping;
            if let Some(commands) = self.commands.lock().unwrap().take() {
                let _ = commands.send(Command::Stop);
            }
            self.pump.lock().unwrap().take()
        };

        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        *self.state.lock().unwrap() = PumpState::Idle;
        info!("Audio input '{}' stopped", self.id);
    }

    fn pump_exited(&self, failure: Option<PipelineError>) {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = failure {
            *self.error.lock().unwrap() = Some(e);
        }
        if *state == PumpState::Running {
            *state = PumpState::Idle;
            self.commands.lock().unwrap().take();
        }
    }

    pub fn state(&self) -> PumpState {
        *self.state.lock().unwrap()
    }

    pub fn is_capturing(&self) -> bool {
        self.state() == PumpState::Running
    }

    pub fn set_muted(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::Relaxed) != muted {
            info!("Audio input '{}' {}", self.id, if muted { "muted" } else { "unmuted" });
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_format(&self, format: AudioFormat) -> Result<()> {
        if !format.is_valid() {
            return Err(PipelineError::Configuration(format!(
                "Invalid capture format {format}"
            )));
        }
        self.target.lock().unwrap().format = format;
        Ok(())
    }

    pub fn set_frame_size(&self, frame_size: usize) -> Result<()> {
        if frame_size == 0 {
            return Err(PipelineError::Configuration(
                "Frame size must be positive".into(),
            ));
        }
        self.target.lock().unwrap().frame_size = frame_size;
        Ok(())
    }

    pub fn format(&self) -> AudioFormat {
        self.target.lock().unwrap().format
    }

    pub fn frame_size(&self) -> usize {
        self.target.lock().unwrap().frame_size
    }

    fn target(&self) -> Target {
        *self.target.lock().unwrap()
    }

    pub fn device_params(&self) -> DeviceParams {
        self.device_params.lock().unwrap().clone()
    }

    pub fn subscribe(&self, observer: FrameObserver) -> Subscription {
        self.observers.subscribe(observer)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    /// The error that stopped the pump, if any.
    pub fn last_error(&self) -> Option<String> {
        self.error.lock().unwrap().as_ref().map(|e| e.to_string())
    }

    pub fn take_error(&self) -> Option<PipelineError> {
        self.error.lock().unwrap().take()
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        // the pump only holds a weak reference and exits on its next tick
        if let Ok(mut commands) = self.commands.lock() {
            if let Some(tx) = commands.take() {
                let _ = tx.send(Command::Stop);
            }
        }
    }
}

/// State owned by the pump thread.
struct Pump {
    id: String,
    frame_duration: Duration,
    backend: Arc<dyn CaptureBackend>,
    source: Option<Box<dyn MediaSource>>,
    resampler: Resampler,
    processor: AudioProcessor,
    resizer: AudioFrameResizer,
}

impl Pump {
    fn new(input: &AudioInput) -> Self {
        let target = input.target();
        let observers = input.observers.clone();
        let emitted = input.frames_emitted.clone();
        let mut next_pts = 0u64;
        let resizer = AudioFrameResizer::new(target.format, target.frame_size, move |frame| {
            let len = frame.samples_per_channel() as u64;
            let frame = Arc::new(frame.with_pts(next_pts));
            next_pts += len;
            emitted.fetch_add(1, Ordering::Relaxed);
            observers.notify(&frame);
        });

        Self {
            id: input.id.clone(),
            frame_duration: input.frame_duration,
            backend: input.backend.clone(),
            source: None,
            resampler: Resampler::new(),
            processor: AudioProcessor::new(&input.processing, target.format),
            resizer,
        }
    }

    fn run(mut self, input: Weak<AudioInput>, commands: Receiver<Command>) {
        debug!("Audio input '{}' pump running", self.id);
        let mut failure = None;
        let mut next_tick = Instant::now();

        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match commands.recv_timeout(timeout) {
                Ok(Command::Switch { resource, reply }) => {
                    let Some(input) = input.upgrade() else { break };
                    let params = self.switch(&resource);
                    *input.device_params.lock().unwrap() = params.clone();
                    let _ = reply.send(params);
                    continue;
                }
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let Some(strong) = input.upgrade() else { break };
            if let Err(e) = self.tick(&strong) {
                if e.is_fatal() {
                    error!("Audio input '{}' stopped: {}", self.id, e);
                    failure = Some(e);
                    break;
                }
                warn!("Audio input '{}': {}", self.id, e);
            }
            drop(strong);

            next_tick += self.frame_duration;
            let now = Instant::now();
            if now > next_tick + self.frame_duration * MAX_LAG_FRAMES {
                debug!("Audio input '{}' fell behind, resetting cadence", self.id);
                next_tick = now;
            }
        }

        self.source = None;
        if let Some(input) = input.upgrade() {
            input.pump_exited(failure);
        }
        debug!("Audio input '{}' pump exited", self.id);
    }

    fn switch(&mut self, resource: &InputResource) -> DeviceParams {
        // release the old source first so a device reader can be re-created
        self.source = None;

        let opened = self.backend.open(resource).or_else(|e| {
            warn!("Audio input '{}' cannot open {:?}: {}", self.id, resource, e);
            if *resource == InputResource::Default {
                return Err(e);
            }
            info!("Audio input '{}' falling back to the default device", self.id);
            self.backend.open(&InputResource::Default)
        });

        match opened {
            Ok(source) => {
                let params = source.params();
                info!(
                    "Audio input '{}' switched to '{}' ({})",
                    self.id, params.name, params.format
                );
                self.source = Some(source);
                params
            }
            Err(e) => {
                warn!("Audio input '{}' has no source, emitting silence: {}", self.id, e);
                DeviceParams::default()
            }
        }
    }

    fn tick(&mut self, input: &AudioInput) -> Result<()> {
        let target = input.target();
        if self.resizer.format() != target.format {
            self.resizer.set_format(target.format);
        }
        if self.resizer.frame_size() != target.frame_size {
            self.resizer.set_frame_size(target.frame_size);
        }

        let captured = self.capture(target.format)?;
        let mut frame = match self.resampler.resample(captured, target.format) {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Audio input '{}' conversion failed: {}", self.id, e);
                self.silence(target.format)
            }
        };

        if input.is_muted() {
            frame.mute();
        } else {
            self.processor.process(&mut frame);
        }
        self.resizer.enqueue(frame)
    }

    /// One period of audio from the source, in the source's format.
    fn capture(&mut self, target: AudioFormat) -> Result<AudioFrame> {
        let Some(source) = self.source.as_mut() else {
            return Ok(self.silence(target));
        };
        let format = source.params().format;
        let wanted = format.samples_for(self.frame_duration);
        match source.read(wanted) {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Ok(AudioFrame::silence(format, wanted, 0)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Audio input '{}' source failed, emitting silence: {}", self.id, e);
                self.source = None;
                Ok(AudioFrame::silence(format, wanted, 0))
            }
        }
    }

    fn silence(&self, format: AudioFormat) -> AudioFrame {
        AudioFrame::silence(format, format.samples_for(self.frame_duration), 0)
    }
}
