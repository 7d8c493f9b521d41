//! Real-time audio transport for voice calls.
//!
//! Audio flows from a capture device or file through a per-call
//! [`AudioInput`](session::AudioInput) pump, is encoded and sent over RTP by an
//! [`AudioSender`](session::AudioSender), and comes back through an
//! [`AudioReceiveThread`](session::AudioReceiveThread) into the call's
//! [`RingBuffer`](audio::RingBuffer) for playback. An
//! [`AudioRtpSession`](session::AudioRtpSession) ties one call together, and the
//! [`AudioRuntime`](runtime::AudioRuntime) owns what calls share.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod io;
pub mod observer;
pub mod runtime;
pub mod session;

pub use config::{PipelineConfig, ProcessingConfig, SessionConfig};
pub use error::{PipelineError, Result};
pub use runtime::AudioRuntime;
