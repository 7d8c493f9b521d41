use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::audio::frame::AudioFrame;
use crate::audio::ring_buffer::RingBuffer;
use crate::codec::{AudioCodec, Decoder};
use crate::error::{PipelineError, Result};
use crate::io::transport::{Transport, create_io_context};
use crate::observer::{FrameObserver, Observable, Subscription};
use crate::session::rtp::{RtpPacket, sequence_gap};

/// Lost packets replaced with concealment audio per gap. Longer gaps are
/// left as a discontinuity.
const MAX_CONCEALED_FRAMES: u16 = 3;
const ERROR_BACKOFF: Duration = Duration::from_millis(10);
/// Silence after which the next packet starts a fresh sequence.
const STREAM_RESET_AFTER: Duration = Duration::from_secs(2);

struct ReceiverShared {
    id: String,
    running: AtomicBool,
    received: AtomicU64,
    lost: AtomicU64,
    observers: Observable,
    failure: Mutex<Option<PipelineError>>,
}

/// Receives RTP packets on a dedicated thread, decodes them and puts the
/// audio into the call's ring buffer.
pub struct AudioReceiveThread {
    shared: Arc<ReceiverShared>,
    transport: Arc<dyn Transport>,
    handle: Option<JoinHandle<()>>,
}

impl AudioReceiveThread {
    pub fn start(
        id: impl Into<String>,
        codec: &AudioCodec,
        transport: Arc<dyn Transport>,
        ring: Arc<RingBuffer>,
        mtu: usize,
        frame_duration: Duration,
    ) -> Result<Self> {
        let id = id.into();
        let decoder = codec.decoder()?;
        let shared = Arc::new(ReceiverShared {
            id: id.clone(),
            running: AtomicBool::new(true),
            received: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            observers: Observable::new(),
            failure: Mutex::new(None),
        });

        let mut receive_loop = ReceiveLoop {
            shared: shared.clone(),
            transport: transport.clone(),
            ring,
            decoder,
            frame_size: codec.frame_size(frame_duration),
            last_sequence: None,
            ssrc: None,
            last_arrival: None,
            next_pts: 0,
        };
        let handle = thread::Builder::new()
            .name(format!("audio-receive-{id}"))
            .spawn(move || receive_loop.run(mtu))?;

        info!("Receiver '{}' started: {} {}", id, codec.name(), codec.format());
        Ok(Self {
            shared,
            transport,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn packets_received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    /// Packets missing from the sequence so far.
    pub fn packets_lost(&self) -> u64 {
        self.shared.lost.load(Ordering::Relaxed)
    }

    /// Decoded frames, including concealment frames.
    pub fn subscribe(&self, observer: FrameObserver) -> Subscription {
        self.shared.observers.subscribe(observer)
    }

    /// Error that ended the receive loop.
    pub fn take_failure(&self) -> Option<PipelineError> {
        self.shared.failure.lock().unwrap().take()
    }

    /// Asks the loop to exit and wakes a blocked receive.
    pub fn interrupt(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.transport.interrupt();
    }

    pub fn stop(&mut self) {
        self.interrupt();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!(
                "Receiver '{}' stopped: {} received, {} lost",
                self.shared.id,
                self.packets_received(),
                self.packets_lost()
            );
        }
    }
}

impl Drop for AudioReceiveThread {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReceiveLoop {
    shared: Arc<ReceiverShared>,
    transport: Arc<dyn Transport>,
    ring: Arc<RingBuffer>,
    decoder: Decoder,
    frame_size: usize,
    last_sequence: Option<u16>,
    ssrc: Option<u32>,
    last_arrival: Option<Instant>,
    next_pts: u64,
}

impl ReceiveLoop {
    fn run(&mut self, mtu: usize) {
        let mut ctx = create_io_context(mtu);
        while self.shared.running.load(Ordering::Acquire) {
            let buf = ctx.buffer_mut();
            let len = match self.transport.receive(buf) {
                Ok(Some(len)) => len,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Receiver '{}' failed to receive: {}", self.shared.id, e);
                    thread::sleep(ERROR_BACKOFF);
                    continue;
                }
            };

            if let Err(e) = self.handle_datagram(&buf[..len]) {
                if e.is_fatal() {
                    error!("Receiver '{}' stopped: {}", self.shared.id, e);
                    *self.shared.failure.lock().unwrap() = Some(e);
                    self.shared.running.store(false, Ordering::Release);
                    break;
                }
                warn!("Receiver '{}': {}", self.shared.id, e);
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        let packet = match RtpPacket::deserialize(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Receiver '{}' dropping datagram: {}", self.shared.id, e);
                return Ok(());
            }
        };

        let now = Instant::now();
        if self.ssrc != Some(packet.ssrc) {
            if let Some(prev) = self.ssrc {
                info!(
                    "Receiver '{}' stream changed from ssrc {:#010x} to {:#010x}",
                    self.shared.id, prev, packet.ssrc
                );
            }
            self.ssrc = Some(packet.ssrc);
            self.last_sequence = None;
        } else if self
            .last_arrival
            .is_some_and(|t| now.duration_since(t) > STREAM_RESET_AFTER)
        {
            debug!("Receiver '{}' resyncing after silence", self.shared.id);
            self.last_sequence = None;
        }
        self.last_arrival = Some(now);

        if let Some(prev) = self.last_sequence {
            let delta = packet.sequence.wrapping_sub(prev);
            if delta == 0 || delta >= 0x8000 {
                trace!("Receiver '{}' dropping late packet {}", self.shared.id, packet.sequence);
                return Ok(());
            }
            let gap = sequence_gap(prev, packet.sequence);
            if gap > 0 {
                self.shared.lost.fetch_add(gap as u64, Ordering::Relaxed);
                debug!("Receiver '{}' lost {} packet(s) before {}", self.shared.id, gap, packet.sequence);
                for _ in 0..gap.min(MAX_CONCEALED_FRAMES) {
                    let frame = self.decoder.conceal(self.frame_size)?;
                    self.deliver(frame)?;
                }
            }
        }
        self.last_sequence = Some(packet.sequence);
        self.shared.received.fetch_add(1, Ordering::Relaxed);

        let frame = match self.decoder.decode(&packet.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Receiver '{}' failed to decode packet {}: {}", self.shared.id, packet.sequence, e);
                self.decoder.conceal(self.frame_size)?
            }
        };
        self.deliver(frame)
    }

    fn deliver(&mut self, frame: AudioFrame) -> Result<()> {
        let frame = frame.with_pts(self.next_pts);
        self.next_pts += frame.samples_per_channel() as u64;
        if !self.shared.observers.is_empty() {
            self.shared.observers.notify(&Arc::new(frame.clone()));
        }
        self.ring.put(frame)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::audio::format::AudioFormat;
    use crate::io::transport::LoopbackTransport;

    fn packet(sequence: u16, value: i16) -> Vec<u8> {
        packet_from(1, sequence, value)
    }

    fn packet_from(ssrc: u32, sequence: u16, value: i16) -> Vec<u8> {
        let pcm = vec![value; 160];
        RtpPacket {
            payload_type: 96,
            marker: false,
            sequence,
            timestamp: sequence as u32 * 160,
            ssrc,
            payload: crate::codec::pcm::encode(&pcm),
        }
        .serialize()
        .unwrap()
    }

    fn setup() -> (LoopbackTransport, AudioReceiveThread, Arc<RingBuffer>) {
        let (peer, local) = LoopbackTransport::pair(Duration::from_millis(20));
        let ring = Arc::new(RingBuffer::new("call", AudioFormat::mono(8000), 32, 160));
        ring.create_read_offset("playback").unwrap();
        let receiver = AudioReceiveThread::start(
            "rx",
            &AudioCodec::l16(8000, 1),
            Arc::new(local),
            ring.clone(),
            1500,
            Duration::from_millis(20),
        )
        .unwrap();
        (peer, receiver, ring)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_received_audio_reaches_ring_buffer() {
        let (peer, mut receiver, ring) = setup();
        peer.send(&packet(1, 100)).unwrap();
        peer.send(&packet(2, 200)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(ring.wait_for_data_available("playback", 320, deadline), 320);
        assert_eq!(ring.get("playback").unwrap().samples().to_i16()[0], 100);
        assert_eq!(ring.get("playback").unwrap().samples().to_i16()[0], 200);
        assert_eq!(receiver.packets_received(), 2);
        receiver.stop();
    }

    #[test]
    fn test_sequence_gap_is_counted_and_concealed() {
        let (peer, mut receiver, ring) = setup();
        peer.send(&packet(65534, 1)).unwrap();
        peer.send(&packet(1, 1)).unwrap();

        assert!(wait_for(|| receiver.packets_received() == 2));
        assert_eq!(receiver.packets_lost(), 2);
        // one decoded, two concealed, one decoded
        assert_eq!(ring.available_for_get("playback"), 4 * 160);
        let frames: Vec<_> = std::iter::from_fn(|| ring.get("playback")).collect();
        assert!(frames[1].is_silent() && frames[2].is_silent());
        receiver.stop();
    }

    #[test]
    fn test_late_and_garbage_datagrams_are_dropped() {
        let (peer, mut receiver, ring) = setup();
        peer.send(&packet(10, 1)).unwrap();
        peer.send(b"not a packet").unwrap();
        peer.send(&packet(9, 1)).unwrap();
        peer.send(&packet(11, 1)).unwrap();

        assert!(wait_for(|| receiver.packets_received() == 2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(receiver.packets_received(), 2);
        assert_eq!(receiver.packets_lost(), 0);
        assert_eq!(ring.available_for_get("playback"), 320);
        receiver.stop();
    }

    #[test]
    fn test_observers_see_decoded_frames() {
        let (peer, mut receiver, _ring) = setup();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let _sub = receiver.subscribe(Arc::new(move |f: &Arc<AudioFrame>| {
            assert_eq!(f.samples_per_channel(), 160);
            c.fetch_add(1, Ordering::SeqCst);
        }));
        peer.send(&packet(1, 5)).unwrap();
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 1));
        receiver.stop();
    }

    #[test]
    fn test_stop_unblocks_promptly() {
        let (peer, local) = LoopbackTransport::pair(Duration::from_secs(30));
        let ring = Arc::new(RingBuffer::new("call", AudioFormat::mono(8000), 8, 160));
        let mut receiver = AudioReceiveThread::start("rx", &AudioCodec::l16(8000, 1), Arc::new(local), ring, 1500, Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        receiver.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!receiver.is_running());
        drop(peer);
    }

    #[test]
    fn test_new_ssrc_restarts_sequence_tracking() {
        let (peer, mut receiver, ring) = setup();
        peer.send(&packet_from(1, 100, 1)).unwrap();
        // far "behind" 100 on the sequence circle
        for sequence in 40000..40011 {
            peer.send(&packet_from(2, sequence, 2)).unwrap();
        }

        assert!(wait_for(|| receiver.packets_received() == 12));
        assert_eq!(receiver.packets_lost(), 0);
        assert_eq!(ring.available_for_get("playback"), 12 * 160);
        receiver.stop();
    }
}
