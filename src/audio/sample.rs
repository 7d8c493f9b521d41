use std::fmt::Debug;

use num_traits::{Bounded, FromPrimitive, Num, ToPrimitive};

pub trait AudioSample:
    Num + Copy + Send + Sync + PartialOrd + ToPrimitive + FromPrimitive + Bounded + Debug + 'static
{
    fn silence() -> Self;

    fn to_f64_normalized(self) -> f64;

    fn from_f64_normalized(value: f64) -> Self;
}

impl AudioSample for f32 {
    fn silence() -> Self {
        0.0
    }

    fn to_f64_normalized(self) -> f64 {
        self as f64
    }

    fn from_f64_normalized(value: f64) -> Self {
        value.clamp(-1.0, 1.0) as f32
    }
}

impl AudioSample for i16 {
    fn silence() -> Self {
        0
    }

    fn to_f64_normalized(self) -> f64 {
        self as f64 / i16::MAX as f64
    }

    fn from_f64_normalized(value: f64) -> Self {
        (value.clamp(-1.0, 1.0) * i16::MAX as f64).round() as i16
    }
}

impl AudioSample for u16 {
    fn silence() -> Self {
        32768
    }

    fn to_f64_normalized(self) -> f64 {
        (self as f64 - 32768.0) / 32768.0
    }

    fn from_f64_normalized(value: f64) -> Self {
        ((value.clamp(-1.0, 1.0) * 32767.0) + 32768.0) as u16
    }
}

/// Converts a slice of one sample type into another through the normalized
/// `f64` range.
pub fn convert_samples<From: AudioSample, To: AudioSample>(input: &[From]) -> Vec<To> {
    input
        .iter()
        .map(|s| To::from_f64_normalized(s.to_f64_normalized()))
        .collect()
}
