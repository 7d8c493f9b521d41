use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use call_audio::codec::AudioCodec;
use call_audio::io::{DevicePlayback, LoopbackTransport, SocketPair};
use call_audio::session::AudioRtpSession;
use call_audio::{AudioRuntime, PipelineConfig, SessionConfig};

const CALL_DURATION: Duration = Duration::from_secs(6);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const MONITOR_READER: &str = "monitor";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

/// Usage: `call-audio [opus|l16] [file://<path>]`
fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let codec = match args.next().as_deref() {
        None | Some("opus") => AudioCodec::opus(48000, 2),
        // uncompressed 48 kHz stereo does not fit one datagram
        Some("l16") => AudioCodec::l16(16000, 1),
        Some(other) => bail!("Unknown codec '{other}', expected opus or l16"),
    };
    let resource = args.next().unwrap_or_default();

    info!("Starting loopback call with {}", codec.name());
    let config = PipelineConfig::default();
    let runtime = AudioRuntime::new(config.clone());

    let _capture = match runtime.start_device_capture() {
        Ok(capture) => Some(capture),
        Err(e) => {
            warn!("No capture device, sending silence: {}", e);
            None
        }
    };

    let alice = runtime.create_session("alice", SessionConfig::with_codec(codec.clone()));
    let bob = runtime.create_session("bob", SessionConfig::with_codec(codec));

    let params = alice
        .audio_input()
        .switch_input(&resource)
        .wait(config.switch_timeout)
        .context("Capture source did not come up")?;
    info!("Alice captures from '{}' ({})", params.name, params.format);

    let (alice_end, bob_end) = LoopbackTransport::pair(Duration::from_millis(100));
    alice.start(SocketPair::new(Arc::new(alice_end)))?;
    bob.start(SocketPair::new(Arc::new(bob_end)))?;

    let ring = bob.ring_buffer().clone();
    ring.create_read_offset(MONITOR_READER)?;
    let _playback = match DevicePlayback::start(ring.clone(), "playback") {
        Ok(playback) => Some(playback),
        Err(e) => {
            warn!("No playback device: {}", e);
            None
        }
    };

    let start = Instant::now();
    let mut restarted = false;
    while start.elapsed() < CALL_DURATION {
        let wanted = config.call_format.samples_for(REPORT_INTERVAL);
        let available = ring.wait_for_data_available(MONITOR_READER, wanted, Instant::now() + REPORT_INTERVAL);
        let consumed = ring.discard(available, MONITOR_READER);
        info!(
            "Bob heard {:?} of audio; alice sent {}, bob received {} (lost {})",
            config.call_format.duration_of(consumed),
            alice.packets_sent(),
            bob.packets_received(),
            bob.packets_lost()
        );

        if !restarted && start.elapsed() >= CALL_DURATION / 2 {
            let first = alice.restart_sender()?;
            info!("Alice's sender restarted at sequence {}", first);
            restarted = true;
        }
        reap(&alice);
        reap(&bob);
    }

    alice.stop();
    bob.stop();
    alice.audio_input().stop();
    bob.audio_input().stop();
    ring.remove_read_offset(MONITOR_READER);
    info!(
        "Call ended: {} overruns on bob's ring buffer",
        ring.overrun_count()
    );
    Ok(())
}

fn reap(session: &AudioRtpSession) {
    for e in session.reap_failed_streams() {
        error!("Session '{}' lost a stream: {}", session.id(), e);
    }
}
