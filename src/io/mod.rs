//! Hardware, file and network I/O.
//!
//! - [`device::DeviceCapture`] / [`device::DevicePlayback`] - Audio devices via cpal
//! - [`file::FileSource`] - Looping media file capture via symphonia
//! - [`source::CaptureBackend`] - Opens capture sources by resource name
//! - [`transport::Transport`] - Datagram transport over UDP or in-process

pub mod device;
pub mod file;
pub mod source;
pub mod transport;

pub use device::{DeviceCapture, DevicePlayback};
pub use file::FileSource;
pub use source::{CaptureBackend, DeviceParams, InputResource, MediaSource, RuntimeBackend};
pub use transport::{IoContext, LoopbackTransport, SocketPair, Transport, UdpTransport, create_io_context};
