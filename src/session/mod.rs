//! Per-call media: the capture pump, the RTP sender and receiver, and the
//! session that ties them to a socket pair.

pub mod input;
pub mod receiver;
pub mod recorder;
pub mod rtp;
pub mod rtp_session;
pub mod sender;

pub use input::{AudioInput, ParamsFuture, PumpState};
pub use receiver::AudioReceiveThread;
pub use recorder::{Recorder, StreamDescriptor, StreamDirection};
pub use rtp_session::{AudioRtpSession, SessionState};
pub use sender::{AudioSender, SenderConfig, SenderSeed};
