use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::audio::format::AudioFormat;
use crate::audio::frame::AudioFrame;
use crate::codec::{AudioCodec, Encoder};
use crate::error::{PipelineError, Result};
use crate::io::transport::Transport;
use crate::observer::Subscription;
use crate::session::input::AudioInput;
use crate::session::rtp::{RtpPacket, datagram_size};

/// How an [`AudioSender`] packetizes its stream.
#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    pub frame_duration: Duration,
    pub payload_type: u8,
    /// Largest datagram the link carries.
    pub mtu: usize,
    /// Build the sender paused; nothing is sent until `resume`.
    pub start_paused: bool,
}

/// Where a sender's stream starts. Used to continue a stream across a
/// sender restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderSeed {
    pub first_sequence: u16,
    pub ssrc: u32,
    pub timestamp: u32,
}

impl SenderSeed {
    pub fn random(ssrc: Option<u32>) -> Self {
        Self {
            first_sequence: rand::random(),
            ssrc: ssrc.unwrap_or_else(rand::random),
            timestamp: rand::random(),
        }
    }
}

struct StreamState {
    encoder: Encoder,
    next_sequence: u16,
    timestamp: u32,
    marker_pending: bool,
}

struct SenderCore {
    id: String,
    transport: Arc<dyn Transport>,
    format: AudioFormat,
    payload_type: u8,
    ssrc: u32,
    first_sequence: u16,
    paused: AtomicBool,
    packets_sent: AtomicU64,
    send_errors: AtomicU64,
    state: Mutex<StreamState>,
}

impl SenderCore {
    fn on_frame(&self, frame: &AudioFrame) {
        let mut state = self.state.lock().unwrap();
        let spc = frame.samples_per_channel() as u32;

        if self.paused.load(Ordering::Acquire) {
            // the media clock keeps running while nothing is sent
            state.timestamp = state.timestamp.wrapping_add(spc);
            return;
        }
        if frame.format() != self.format {
            // the input is being reconfigured
            trace!("Sender '{}' skipping {} frame", self.id, frame.format());
            return;
        }

        let timestamp = state.timestamp;
        state.timestamp = timestamp.wrapping_add(spc);

        let payload = match state.encoder.encode(frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Sender '{}' failed to encode: {}", self.id, e);
                return;
            }
        };
        let packet = RtpPacket {
            payload_type: self.payload_type,
            marker: state.marker_pending,
            sequence: state.next_sequence,
            timestamp,
            ssrc: self.ssrc,
            payload,
        };

        match packet.serialize().and_then(|bytes| self.transport.send(&bytes)) {
            Ok(_) => {
                state.next_sequence = state.next_sequence.wrapping_add(1);
                state.marker_pending = false;
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if self.send_errors.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("Sender '{}' failed to send packet: {}", self.id, e);
                } else {
                    trace!("Sender '{}' failed to send packet: {}", self.id, e);
                }
            }
        }
    }
}

/// Encodes frames from an [`AudioInput`] and sends them as RTP packets.
///
/// Frames are encoded on the input's pump thread. Dropping the sender
/// detaches it from the input.
pub struct AudioSender {
    core: Arc<SenderCore>,
    audio_input: Arc<AudioInput>,
    _subscription: Subscription,
}

impl AudioSender {
    pub fn new(
        id: impl Into<String>,
        codec: &AudioCodec,
        transport: Arc<dyn Transport>,
        audio_input: Arc<AudioInput>,
        config: &SenderConfig,
        seed: SenderSeed,
    ) -> Result<Self> {
        let id = id.into();
        let largest = datagram_size(codec.max_payload_size(config.frame_duration))?;
        if largest > config.mtu {
            return Err(PipelineError::Configuration(format!(
                "{} {} packets of {:?} need {} bytes, mtu is {}",
                codec.name(),
                codec.format(),
                config.frame_duration,
                largest,
                config.mtu
            )));
        }
        let encoder = codec.encoder()?;
        let format = encoder.format();
        audio_input.set_format(format)?;
        audio_input.set_frame_size(codec.frame_size(config.frame_duration))?;

        let core = Arc::new(SenderCore {
            id: id.clone(),
            transport,
            format,
            payload_type: config.payload_type,
            ssrc: seed.ssrc,
            first_sequence: seed.first_sequence,
            paused: AtomicBool::new(config.start_paused),
            packets_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            state: Mutex::new(StreamState {
                encoder,
                next_sequence: seed.first_sequence,
                timestamp: seed.timestamp,
                marker_pending: true,
            }),
        });

        let observer = core.clone();
        let subscription = audio_input.subscribe(Arc::new(move |frame: &Arc<AudioFrame>| {
            observer.on_frame(frame)
        }));

        info!(
            "Sender '{}' started: {} {}, ssrc {:#010x}, first sequence {}",
            id,
            codec.name(),
            format,
            seed.ssrc,
            seed.first_sequence
        );
        Ok(Self {
            core,
            audio_input,
            _subscription: subscription,
        })
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn ssrc(&self) -> u32 {
        self.core.ssrc
    }

    pub fn first_sequence(&self) -> u16 {
        self.core.first_sequence
    }

    /// Sequence number of the last packet sent, or the one before
    /// [`first_sequence`](Self::first_sequence) if nothing was sent yet.
    pub fn last_sequence(&self) -> u16 {
        self.core.state.lock().unwrap().next_sequence.wrapping_sub(1)
    }

    /// RTP timestamp the next packet will carry.
    pub fn timestamp(&self) -> u32 {
        self.core.state.lock().unwrap().timestamp
    }

    /// Seed for a replacement that continues this stream.
    pub fn continuation(&self) -> SenderSeed {
        let state = self.core.state.lock().unwrap();
        SenderSeed {
            first_sequence: state.next_sequence,
            ssrc: self.core.ssrc,
            timestamp: state.timestamp,
        }
    }

    pub fn packets_sent(&self) -> u64 {
        self.core.packets_sent.load(Ordering::Relaxed)
    }

    pub fn format(&self) -> AudioFormat {
        self.core.format
    }

    pub fn pause(&self) {
        // taking the state lock waits out a frame being sent
        let _state = self.core.state.lock().unwrap();
        self.core.paused.store(true, Ordering::Release);
        debug!("Sender '{}' paused", self.core.id);
    }

    /// Resumes sending; the next packet carries the marker bit.
    pub fn resume(&self) {
        let mut state = self.core.state.lock().unwrap();
        state.marker_pending = true;
        self.core.paused.store(false, Ordering::Release);
        debug!("Sender '{}' resumed", self.core.id);
    }

    pub fn is_paused(&self) -> bool {
        self.core.paused.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio_input.set_muted(muted);
    }
}

impl Drop for AudioSender {
    fn drop(&mut self) {
        debug!(
            "Sender '{}' stopped after {} packets",
            self.core.id,
            self.packets_sent()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::PipelineError;
    use crate::io::source::{CaptureBackend, InputResource, MediaSource};
    use crate::io::transport::{LoopbackTransport, create_io_context};

    struct SilentBackend;

    impl CaptureBackend for SilentBackend {
        fn open(&self, _: &InputResource) -> Result<Box<dyn MediaSource>> {
            Err(PipelineError::ResourceUnavailable("no device".into()))
        }
    }

    fn input() -> Arc<AudioInput> {
        let config = PipelineConfig {
            frame_duration: Duration::from_millis(10),
            ..Default::default()
        };
        AudioInput::new("send", &config, Arc::new(SilentBackend))
    }

    fn config() -> SenderConfig {
        SenderConfig {
            frame_duration: Duration::from_millis(10),
            payload_type: 96,
            mtu: 1500,
            start_paused: false,
        }
    }

    fn receive_packets(transport: &LoopbackTransport, count: usize) -> Vec<RtpPacket> {
        let mut ctx = create_io_context(1500);
        let mut packets = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while packets.len() < count && Instant::now() < deadline {
            let buf = ctx.buffer_mut();
            if let Some(n) = transport.receive(buf).unwrap() {
                packets.push(RtpPacket::deserialize(&buf[..n]).unwrap());
            }
        }
        packets
    }

    #[test]
    fn test_configures_input_to_codec() {
        let (local, _remote) = LoopbackTransport::pair(Duration::from_millis(20));
        let input = input();
        let codec = AudioCodec::l16(16000, 1);
        let seed = SenderSeed::random(None);
        let _sender = AudioSender::new("s", &codec, Arc::new(local), input.clone(), &config(), seed).unwrap();
        assert_eq!(input.format(), AudioFormat::mono(16000));
        assert_eq!(input.frame_size(), 160);
        assert_eq!(input.observer_count(), 1);
    }

    #[test]
    fn test_sends_consecutive_packets() {
        let (local, remote) = LoopbackTransport::pair(Duration::from_millis(20));
        let input = input();
        let seed = SenderSeed {
            first_sequence: 65534,
            ssrc: 42,
            timestamp: 1000,
        };
        let sender = AudioSender::new(
            "s",
            &AudioCodec::l16(8000, 1),
            Arc::new(local),
            input.clone(),
            &config(),
            seed,
        )
        .unwrap();
        input.switch_input("").wait(Duration::from_secs(2)).unwrap();

        let packets = receive_packets(&remote, 4);
        input.stop();
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[0].sequence, 65534);
        assert_eq!(packets[2].sequence, 0);
        assert!(packets[0].marker);
        assert!(!packets[1].marker);
        assert!(packets.iter().all(|p| p.ssrc == 42 && p.payload_type == 96));
        assert_eq!(packets[1].timestamp, 1080);
        assert_eq!(packets[0].payload.len(), 160);
        assert!(sender.packets_sent() >= 4);
    }

    #[test]
    fn test_pause_stops_sending_and_keeps_clock() {
        let (local, remote) = LoopbackTransport::pair(Duration::from_millis(20));
        let input = input();
        let seed = SenderSeed {
            first_sequence: 10,
            ssrc: 7,
            timestamp: 0,
        };
        let sender = AudioSender::new("s", &AudioCodec::l16(8000, 1), Arc::new(local), input.clone(), &config(), seed).unwrap();
        sender.pause();
        input.switch_input("").wait(Duration::from_secs(2)).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(sender.packets_sent(), 0);
        assert_eq!(sender.last_sequence(), 9);
        assert!(sender.timestamp() > 0);

        sender.resume();
        let packets = receive_packets(&remote, 1);
        input.stop();
        assert_eq!(packets[0].sequence, 10);
        assert!(packets[0].marker);
        assert!(packets[0].timestamp > 0);
    }

    #[test]
    fn test_drop_detaches_from_input() {
        let (local, _remote) = LoopbackTransport::pair(Duration::from_millis(20));
        let input = input();
        let sender = AudioSender::new("s", &AudioCodec::l16(8000, 1), Arc::new(local), input.clone(), &config(), SenderSeed::random(Some(5))).unwrap();
        assert_eq!(sender.ssrc(), 5);
        drop(sender);
        assert_eq!(input.observer_count(), 0);
    }

    #[test]
    fn test_rejects_packets_larger_than_mtu() {
        let (local, _remote) = LoopbackTransport::pair(Duration::from_millis(20));
        let input = input();
        let config = SenderConfig {
            frame_duration: Duration::from_millis(20),
            ..config()
        };
        // 960 stereo samples of 16 bits do not fit in 1500 bytes
        let err = AudioSender::new("s", &AudioCodec::l16(48000, 2), Arc::new(local), input.clone(), &config, SenderSeed::random(None))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(input.observer_count(), 0);
        assert_eq!(input.frame_size(), 480);
    }

    #[test]
    fn test_starts_paused_when_asked() {
        let (local, remote) = LoopbackTransport::pair(Duration::from_millis(20));
        let input = input();
        let config = SenderConfig {
            start_paused: true,
            ..config()
        };
        let seed = SenderSeed {
            first_sequence: 500,
            ssrc: 3,
            timestamp: 0,
        };
        let sender = AudioSender::new("s", &AudioCodec::l16(8000, 1), Arc::new(local), input.clone(), &config, seed).unwrap();
        assert!(sender.is_paused());
        input.switch_input("").wait(Duration::from_secs(2)).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(sender.packets_sent(), 0);

        sender.resume();
        let packets = receive_packets(&remote, 2);
        input.stop();
        assert_eq!(packets[0].sequence, 500);
        assert!(packets[0].marker);
        assert!(!packets[1].marker);
    }
}
