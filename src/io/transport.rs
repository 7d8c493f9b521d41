//! Datagram transports for RTP sessions.
//!
//! - [`UdpTransport`] - a connected UDP socket built with `socket2`
//! - [`LoopbackTransport`] - an in-process pair backed by crossbeam channels
//!
//! Both implement [`Transport`], whose `receive` blocks until a datagram
//! arrives, the poll interval passes, or [`Transport::interrupt`] is called.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use crossbeam::channel::{self, Receiver, Sender};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

pub trait Transport: Send + Sync {
    fn send(&self, datagram: &[u8]) -> Result<usize>;

    /// Waits for one datagram. `Ok(None)` means interrupted or nothing
    /// arrived within the poll interval.
    fn receive(&self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Wakes a blocked `receive`; later calls return `None` immediately.
    fn interrupt(&self);

    fn is_interrupted(&self) -> bool;
}

/// Receive buffer sized for one datagram of `mtu` bytes.
pub struct IoContext {
    buffer: Vec<u8>,
}

impl IoContext {
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

pub fn create_io_context(mtu: usize) -> IoContext {
    IoContext {
        buffer: vec![0u8; mtu.max(1)],
    }
}

/// RTP and optional RTCP transports of one session.
#[derive(Clone)]
pub struct SocketPair {
    pub rtp: Arc<dyn Transport>,
    pub rtcp: Option<Arc<dyn Transport>>,
}

impl SocketPair {
    pub fn new(rtp: Arc<dyn Transport>) -> Self {
        Self { rtp, rtcp: None }
    }

    pub fn with_rtcp(mut self, rtcp: Arc<dyn Transport>) -> Self {
        self.rtcp = Some(rtcp);
        self
    }

    /// UDP pair on `local`/`remote`, RTCP on the next port up.
    pub fn udp(local: SocketAddr, remote: SocketAddr, poll: Duration) -> Result<Self> {
        let rtp = UdpTransport::bind(local, remote, poll)?;
        let next = |addr: SocketAddr| SocketAddr::new(addr.ip(), addr.port().wrapping_add(1));
        let rtcp = UdpTransport::bind(next(local), next(remote), poll)?;
        Ok(Self::new(Arc::new(rtp)).with_rtcp(Arc::new(rtcp)))
    }

    pub fn interrupt(&self) {
        self.rtp.interrupt();
        if let Some(rtcp) = &self.rtcp {
            rtcp.interrupt();
        }
    }
}

pub struct UdpTransport {
    socket: std::net::UdpSocket,
    remote: SocketAddr,
    interrupted: AtomicBool,
}

impl UdpTransport {
    pub fn bind(local: SocketAddr, remote: SocketAddr, poll: Duration) -> Result<Self> {
        Self::open(local, remote, poll).map_err(|e| PipelineError::Transport(format!("{e:#}")))
    }

    fn open(local: SocketAddr, remote: SocketAddr, poll: Duration) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create socket")?;
        socket
            .set_reuse_address(true)
            .context("Failed to set reuse address")?;
        socket
            .bind(&local.into())
            .context(format!("Failed to bind socket to {local}"))?;
        socket
            .set_read_timeout(Some(poll))
            .context("Failed to set read timeout")?;

        info!("UDP transport {} -> {}", local, remote);
        Ok(Self {
            socket: socket.into(),
            remote,
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn send(&self, datagram: &[u8]) -> Result<usize> {
        let sent = self.socket.send_to(datagram, self.remote)?;
        if sent < datagram.len() {
            warn!("Partial sent: {}/{}", sent, datagram.len());
        }
        Ok(sent)
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.is_interrupted() {
            return Ok(None);
        }
        match self.socket.recv_from(buf) {
            Ok((size, from)) => {
                if from != self.remote {
                    debug!("Datagram from unexpected peer {}", from);
                }
                Ok(Some(size))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

/// One end of an in-process datagram link.
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    poll: Duration,
    interrupted: AtomicBool,
}

impl LoopbackTransport {
    /// Two connected ends: what one sends the other receives.
    pub fn pair(poll: Duration) -> (Self, Self) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();
        (Self::end(a_tx, a_rx, poll), Self::end(b_tx, b_rx, poll))
    }

    fn end(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>, poll: Duration) -> Self {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            tx,
            rx,
            wake_tx,
            wake_rx,
            poll,
            interrupted: AtomicBool::new(false),
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, datagram: &[u8]) -> Result<usize> {
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| PipelineError::Transport("Loopback peer closed".into()))?;
        Ok(datagram.len())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.is_interrupted() {
            return Ok(None);
        }
        channel::select! {
            recv(self.rx) -> msg => match msg {
                Ok(datagram) => {
                    let len = datagram.len().min(buf.len());
                    if len < datagram.len() {
                        warn!("Truncated datagram: {}/{}", len, datagram.len());
                    }
                    buf[..len].copy_from_slice(&datagram[..len]);
                    Ok(Some(len))
                }
                Err(_) => Err(PipelineError::Transport("Loopback peer closed".into())),
            },
            recv(self.wake_rx) -> _ => Ok(None),
            default(self.poll) => Ok(None),
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}
