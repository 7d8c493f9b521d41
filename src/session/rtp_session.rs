//! One call's RTP audio session.
//!
//! An [`AudioRtpSession`] owns the socket pair, the [`AudioSender`] and the
//! [`AudioReceiveThread`] of a call. The two directions fail independently:
//! a sender or receiver that cannot be built leaves the other running.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::audio::ring_buffer::RingBuffer;
use crate::config::{PipelineConfig, SessionConfig};
use crate::error::{PipelineError, Result};
use crate::io::transport::SocketPair;
use crate::observer::Subscription;
use crate::session::input::AudioInput;
use crate::session::receiver::AudioReceiveThread;
use crate::session::recorder::{Recorder, StreamDescriptor, StreamDirection};
use crate::session::sender::{AudioSender, SenderConfig, SenderSeed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Active,
}

struct RecordedStream {
    name: String,
    _subscription: Subscription,
}

struct RecorderAttachment {
    recorder: Arc<dyn Recorder>,
    local: Option<RecordedStream>,
    remote: Option<RecordedStream>,
}

impl RecorderAttachment {
    fn detach_remote(&mut self) {
        if let Some(stream) = self.remote.take() {
            let name = stream.name.clone();
            drop(stream);
            self.recorder.remove_stream(&name);
        }
    }

    fn detach_all(&mut self) {
        self.detach_remote();
        if let Some(stream) = self.local.take() {
            let name = stream.name.clone();
            drop(stream);
            self.recorder.remove_stream(&name);
        }
    }
}

struct SessionInner {
    state: SessionState,
    sockets: Option<SocketPair>,
    sender: Option<AudioSender>,
    receiver: Option<AudioReceiveThread>,
    recorder: Option<RecorderAttachment>,
}

pub struct AudioRtpSession {
    id: String,
    config: SessionConfig,
    frame_duration: Duration,
    switch_timeout: Duration,
    mtu: usize,
    audio_input: Arc<AudioInput>,
    ring: Arc<RingBuffer>,
    inner: Mutex<SessionInner>,
}

impl AudioRtpSession {
    pub fn new(
        id: impl Into<String>,
        config: SessionConfig,
        pipeline: &PipelineConfig,
        audio_input: Arc<AudioInput>,
        ring: Arc<RingBuffer>,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            frame_duration: pipeline.frame_duration,
            switch_timeout: pipeline.switch_timeout,
            mtu: pipeline.mtu,
            audio_input,
            ring,
            inner: Mutex::new(SessionInner {
                state: SessionState::Stopped,
                sockets: None,
                sender: None,
                receiver: None,
                recorder: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn audio_input(&self) -> &Arc<AudioInput> {
        &self.audio_input
    }

    pub fn ring_buffer(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Starts sending and receiving over `sockets`.
    pub fn start(&self, sockets: SocketPair) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Stopped {
            return Err(PipelineError::InvalidState(format!(
                "Session '{}' already started",
                self.id
            )));
        }
        inner.state = SessionState::Starting;
        info!("Starting audio session '{}'", self.id);

        if !self.audio_input.is_capturing() {
            match self.audio_input.switch_input("").wait(self.switch_timeout) {
                Ok(params) => debug!("Session '{}' capturing from '{}'", self.id, params.name),
                Err(e) => warn!("Session '{}' capture not ready: {}", self.id, e),
            }
        }

        inner.sender = match self.build_sender(&sockets, SenderSeed::random(self.config.ssrc), false) {
            Ok(sender) => Some(sender),
            Err(e) => {
                error!("Session '{}' cannot send: {}", self.id, e);
                None
            }
        };

        inner.receiver = match AudioReceiveThread::start(
            format!("{}-rx", self.id),
            &self.config.receive_codec,
            sockets.rtp.clone(),
            self.ring.clone(),
            self.mtu,
            self.frame_duration,
        ) {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                error!("Session '{}' cannot receive: {}", self.id, e);
                None
            }
        };

        inner.sockets = Some(sockets);
        let inner = &mut *inner;
        if let (Some(attachment), Some(receiver)) = (inner.recorder.as_mut(), inner.receiver.as_ref()) {
            attachment.remote = Some(self.record_remote(attachment.recorder.as_ref(), receiver));
        }
        inner.state = SessionState::Active;
        info!(
            "Audio session '{}' active (send: {}, receive: {})",
            self.id,
            inner.sender.is_some(),
            inner.receiver.is_some()
        );
        Ok(())
    }

    /// Binds UDP sockets on `local` towards `remote` and starts over them.
    /// Blocking receives wake every `receive_poll` to check for shutdown.
    pub fn start_udp(&self, local: SocketAddr, remote: SocketAddr) -> Result<()> {
        let sockets = SocketPair::udp(local, remote, self.config.receive_poll)?;
        self.start(sockets)
    }

    fn build_sender(&self, sockets: &SocketPair, seed: SenderSeed, start_paused: bool) -> Result<AudioSender> {
        let config = SenderConfig {
            frame_duration: self.frame_duration,
            payload_type: self.config.payload_type,
            mtu: self.mtu,
            start_paused,
        };
        AudioSender::new(
            format!("{}-tx", self.id),
            &self.config.send_codec,
            sockets.rtp.clone(),
            self.audio_input.clone(),
            &config,
            seed,
        )
    }

    /// Replaces the sender without a gap in the outgoing sequence: the new
    /// sender continues the old one's SSRC, sequence and timestamp.
    /// Returns the first sequence number of the new sender.
    pub fn restart_sender(&self) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SessionState::Active {
            return Err(PipelineError::InvalidState(format!(
                "Session '{}' is not active",
                self.id
            )));
        }
        let Some(sockets) = inner.sockets.clone() else {
            return Err(PipelineError::InvalidState(format!(
                "Session '{}' has no sockets",
                self.id
            )));
        };

        let seed = match inner.sender.as_ref() {
            Some(old) => {
                old.pause();
                old.continuation()
            }
            None => SenderSeed::random(self.config.ssrc),
        };

        let replacement = match self.build_sender(&sockets, seed, true) {
            Ok(sender) => sender,
            Err(e) => {
                if let Some(old) = inner.sender.as_ref() {
                    old.resume();
                }
                return Err(e);
            }
        };
        let old = inner.sender.replace(replacement);
        drop(old);
        if let Some(sender) = inner.sender.as_ref() {
            sender.resume();
        }
        info!("Session '{}' sender restarted at sequence {}", self.id, seed.first_sequence);
        Ok(seed.first_sequence)
    }

    /// Tears down the receiver, then the sender, then the sockets.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == SessionState::Stopped {
            return;
        }
        if let Some(mut receiver) = inner.receiver.take() {
            receiver.stop();
        }
        if let Some(attachment) = inner.recorder.as_mut() {
            attachment.detach_remote();
        }
        if let Some(sender) = inner.sender.take() {
            sender.pause();
        }
        if let Some(sockets) = inner.sockets.take() {
            sockets.interrupt();
        }
        inner.state = SessionState::Stopped;
        info!("Audio session '{}' stopped", self.id);
    }

    /// Mutes the outgoing audio. Without a sender this does nothing.
    pub fn set_muted(&self, muted: bool) {
        let inner = self.inner.lock().unwrap();
        match inner.sender.as_ref() {
            Some(sender) => sender.set_muted(muted),
            None => debug!("Session '{}' has no sender to mute", self.id),
        }
    }

    /// Feeds both directions of the call to `recorder`. The receive side is
    /// attached now if the session is running, otherwise on start.
    pub fn init_recorder(&self, recorder: Arc<dyn Recorder>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut previous) = inner.recorder.take() {
            previous.detach_all();
        }

        let local_name = format!("{}:local", self.id);
        let observer = recorder.add_stream(&StreamDescriptor {
            name: local_name.clone(),
            format: self.audio_input.format(),
            direction: StreamDirection::Local,
        });
        let local = RecordedStream {
            name: local_name,
            _subscription: self.audio_input.subscribe(observer),
        };

        let remote = inner
            .receiver
            .as_ref()
            .map(|receiver| self.record_remote(recorder.as_ref(), receiver));
        inner.recorder = Some(RecorderAttachment {
            recorder,
            local: Some(local),
            remote,
        });
        info!("Session '{}' recording", self.id);
    }

    fn record_remote(&self, recorder: &dyn Recorder, receiver: &AudioReceiveThread) -> RecordedStream {
        let name = format!("{}:remote", self.id);
        let observer = recorder.add_stream(&StreamDescriptor {
            name: name.clone(),
            format: self.config.receive_codec.format(),
            direction: StreamDirection::Remote,
        });
        RecordedStream {
            name,
            _subscription: receiver.subscribe(observer),
        }
    }

    pub fn deinit_recorder(&self) {
        if let Some(mut attachment) = self.inner.lock().unwrap().recorder.take() {
            attachment.detach_all();
            info!("Session '{}' recording stopped", self.id);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.lock().unwrap().recorder.is_some()
    }

    /// Tears down every direction whose loop ended with a fatal error and
    /// returns those errors. The rest of the session keeps running.
    pub fn reap_failed_streams(&self) -> Vec<PipelineError> {
        let mut inner = self.inner.lock().unwrap();
        let mut failures = Vec::new();

        let receiver_failure = inner.receiver.as_ref().and_then(|r| r.take_failure());
        if let Some(e) = receiver_failure {
            warn!("Session '{}' receive stream failed: {}", self.id, e);
            if let Some(mut receiver) = inner.receiver.take() {
                receiver.stop();
            }
            if let Some(attachment) = inner.recorder.as_mut() {
                attachment.detach_remote();
            }
            failures.push(e);
        }

        if let Some(e) = self.audio_input.take_error() {
            warn!("Session '{}' send stream failed: {}", self.id, e);
            inner.sender.take();
            failures.push(e);
        }
        failures
    }

    pub fn has_sender(&self) -> bool {
        self.inner.lock().unwrap().sender.is_some()
    }

    pub fn has_receiver(&self) -> bool {
        self.inner.lock().unwrap().receiver.is_some()
    }

    pub fn first_sequence(&self) -> Option<u16> {
        self.inner.lock().unwrap().sender.as_ref().map(|s| s.first_sequence())
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.inner.lock().unwrap().sender.as_ref().map(|s| s.last_sequence())
    }

    pub fn packets_sent(&self) -> u64 {
        self.inner.lock().unwrap().sender.as_ref().map_or(0, |s| s.packets_sent())
    }

    pub fn packets_received(&self) -> u64 {
        self.inner.lock().unwrap().receiver.as_ref().map_or(0, |r| r.packets_received())
    }

    pub fn packets_lost(&self) -> u64 {
        self.inner.lock().unwrap().receiver.as_ref().map_or(0, |r| r.packets_lost())
    }
}

impl Drop for AudioRtpSession {
    fn drop(&mut self) {
        self.stop();
        self.deinit_recorder();
    }
}
