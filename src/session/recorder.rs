//! Interface to an external call recorder.

use crate::audio::format::AudioFormat;
use crate::observer::FrameObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Audio captured locally and sent to the peer.
    Local,
    /// Audio received from the peer.
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub name: String,
    pub format: AudioFormat,
    pub direction: StreamDirection,
}

/// A sink that records call audio. Each stream added gets its own observer,
/// which the session feeds like any other frame observer.
pub trait Recorder: Send + Sync {
    fn add_stream(&self, stream: &StreamDescriptor) -> FrameObserver;

    /// Called once a stream's observer is detached.
    fn remove_stream(&self, _name: &str) {}
}
