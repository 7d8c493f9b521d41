//! Audio data types and the stages that reshape them.
//!
//! # Data Types
//! - [`AudioSample`] - Trait for audio sample types (i16, f32, etc.)
//! - [`format::AudioFormat`] - Sample rate, channel count and representation
//! - [`frame::AudioFrame`] - Interleaved samples with a format and timestamp
//!
//! # Stages
//! - [`resampler::Resampler`] - Rate, channel and representation conversion
//! - [`resizer::AudioFrameResizer`] - Cuts sample runs into fixed-size frames
//! - [`ring_buffer::RingBuffer`] - Multi-reader frame store
//! - [`processor::AudioProcessor`] - DC blocker, noise gate, voice detection

pub mod format;
pub mod frame;
pub mod processor;
pub mod resampler;
pub mod resizer;
pub mod ring_buffer;
pub mod sample;

pub use format::{AudioFormat, SampleFormat};
pub use frame::{AudioFrame, Samples};
pub use processor::{AudioProcessor, ProcessingStage};
pub use resampler::Resampler;
pub use resizer::AudioFrameResizer;
pub use ring_buffer::RingBuffer;
pub use sample::AudioSample;
