//! Audio codecs available to RTP sessions.
//!
//! [`AudioCodec`] describes a negotiated codec; it builds an [`Encoder`] and a
//! [`Decoder`], each bound to the codec's [`AudioFormat`]. Bitstream details
//! stay inside the backend modules.

pub mod opus;
pub mod pcm;

use std::time::Duration;

use crate::audio::format::{AudioFormat, SampleFormat};
use crate::audio::frame::{AudioFrame, Samples};
use crate::error::{PipelineError, Result};

use self::opus::{OpusDecoder, OpusEncoder};

const DEFAULT_OPUS_BITRATE: i32 = 64000;
/// Largest compressed Opus frame (RFC 6716, section 3.4).
const MAX_OPUS_FRAME_BYTES: usize = 1275;

#[derive(Debug, Clone, PartialEq)]
pub enum AudioCodec {
    Opus {
        sample_rate: u32,
        channels: u16,
        bitrate: i32,
    },
    L16 {
        sample_rate: u32,
        channels: u16,
    },
}

impl AudioCodec {
    pub fn opus(sample_rate: u32, channels: u16) -> Self {
        AudioCodec::Opus {
            sample_rate,
            channels,
            bitrate: DEFAULT_OPUS_BITRATE,
        }
    }

    pub fn l16(sample_rate: u32, channels: u16) -> Self {
        AudioCodec::L16 {
            sample_rate,
            channels,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AudioCodec::Opus { .. } => "opus",
            AudioCodec::L16 { .. } => "L16",
        }
    }

    /// Format the encoder consumes and the decoder produces.
    pub fn format(&self) -> AudioFormat {
        match *self {
            AudioCodec::Opus {
                sample_rate,
                channels,
                ..
            }
            | AudioCodec::L16 {
                sample_rate,
                channels,
            } => AudioFormat::new(sample_rate, channels, SampleFormat::S16),
        }
    }

    /// Samples per channel in one packet of `frame_duration`.
    pub fn frame_size(&self, frame_duration: Duration) -> usize {
        self.format().samples_for(frame_duration)
    }

    /// Upper bound on the payload of one packet of `frame_duration`.
    pub fn max_payload_size(&self, frame_duration: Duration) -> usize {
        match self {
            AudioCodec::Opus { .. } => MAX_OPUS_FRAME_BYTES,
            AudioCodec::L16 { channels, .. } => {
                self.frame_size(frame_duration) * *channels as usize * 2
            }
        }
    }

    pub fn encoder(&self) -> Result<Encoder> {
        let format = self.format();
        match *self {
            AudioCodec::Opus {
                sample_rate,
                channels,
                bitrate,
            } => {
                let encoder = OpusEncoder::new(sample_rate, channels, bitrate)
                    .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;
                Ok(Encoder::Opus { encoder, format })
            }
            AudioCodec::L16 { .. } => Ok(Encoder::L16 { format }),
        }
    }

    pub fn decoder(&self) -> Result<Decoder> {
        let format = self.format();
        match *self {
            AudioCodec::Opus {
                sample_rate,
                channels,
                ..
            } => {
                let decoder = OpusDecoder::new(sample_rate, channels)
                    .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;
                Ok(Decoder::Opus { decoder, format })
            }
            AudioCodec::L16 { .. } => Ok(Decoder::L16 { format }),
        }
    }
}

impl Default for AudioCodec {
    /// Opus, 48 kHz stereo.
    fn default() -> Self {
        Self::opus(48000, 2)
    }
}

pub enum Encoder {
    Opus {
        encoder: OpusEncoder,
        format: AudioFormat,
    },
    L16 {
        format: AudioFormat,
    },
}

impl Encoder {
    pub fn format(&self) -> AudioFormat {
        match self {
            Encoder::Opus { format, .. } | Encoder::L16 { format } => *format,
        }
    }

    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<u8>> {
        if frame.format() != self.format() {
            return Err(PipelineError::Codec(format!(
                "Encoder expects {}, got {}",
                self.format(),
                frame.format()
            )));
        }
        let pcm = frame.samples().to_i16();
        match self {
            Encoder::Opus { encoder, .. } => encoder
                .encode(&pcm)
                .map_err(|e| PipelineError::Codec(format!("{e:#}"))),
            Encoder::L16 { .. } => Ok(pcm::encode(&pcm)),
        }
    }
}

pub enum Decoder {
    Opus {
        decoder: OpusDecoder,
        format: AudioFormat,
    },
    L16 {
        format: AudioFormat,
    },
}

impl Decoder {
    pub fn format(&self) -> AudioFormat {
        match self {
            Decoder::Opus { format, .. } | Decoder::L16 { format } => *format,
        }
    }

    pub fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame> {
        let format = self.format();
        let pcm = match self {
            Decoder::Opus { decoder, .. } => decoder
                .decode(payload)
                .map_err(|e| PipelineError::Codec(format!("{e:#}")))?,
            Decoder::L16 { format } => pcm::decode(payload, format.channels)?,
        };
        AudioFrame::new(format, Samples::S16(pcm), 0)
    }

    /// Replacement audio for a lost packet of `samples_per_channel`.
    pub fn conceal(&mut self, samples_per_channel: usize) -> Result<AudioFrame> {
        let format = self.format();
        match self {
            Decoder::Opus { decoder, .. } => {
                let pcm = decoder
                    .decode_missing(samples_per_channel)
                    .map_err(|e| PipelineError::Codec(format!("{e:#}")))?;
                AudioFrame::new(format, Samples::S16(pcm), 0)
            }
            Decoder::L16 { .. } => Ok(AudioFrame::silence(format, samples_per_channel, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_format_and_frame_size() {
        let codec = AudioCodec::opus(48000, 2);
        assert_eq!(codec.format(), AudioFormat::stereo(48000));
        assert_eq!(codec.frame_size(Duration::from_millis(20)), 960);
        assert_eq!(AudioCodec::l16(8000, 1).frame_size(Duration::from_millis(20)), 160);
    }

    #[test]
    fn test_max_payload_size() {
        let frame = Duration::from_millis(20);
        assert_eq!(AudioCodec::l16(8000, 1).max_payload_size(frame), 320);
        assert_eq!(AudioCodec::l16(48000, 2).max_payload_size(frame), 3840);
        assert_eq!(AudioCodec::opus(48000, 2).max_payload_size(frame), 1275);
    }

    #[test]
    fn test_l16_roundtrip_is_exact() {
        let codec = AudioCodec::l16(8000, 1);
        let mut encoder = codec.encoder().unwrap();
        let mut decoder = codec.decoder().unwrap();

        let frame = AudioFrame::from_i16(8000, 1, (0..160).map(|i| i * 100 - 8000).collect()).unwrap();
        let payload = encoder.encode(&frame).unwrap();
        assert_eq!(payload.len(), 320);
        let decoded = decoder.decode(&payload).unwrap();
        assert_eq!(decoded.samples(), frame.samples());
    }

    #[test]
    fn test_encoder_rejects_foreign_format() {
        let mut encoder = AudioCodec::l16(8000, 1).encoder().unwrap();
        let frame = AudioFrame::from_i16(16000, 1, vec![0; 320]).unwrap();
        assert!(matches!(encoder.encode(&frame), Err(PipelineError::Codec(_))));
    }

    #[test]
    fn test_opus_frame_through_codec_layer() {
        let codec = AudioCodec::opus(48000, 1);
        let mut encoder = codec.encoder().unwrap();
        let mut decoder = codec.decoder().unwrap();

        let frame = AudioFrame::from_i16(
            48000,
            1,
            (0..960).map(|i| ((i as f32 * 0.1).sin() * 10000.0) as i16).collect(),
        )
        .unwrap();
        let payload = encoder.encode(&frame).unwrap();
        let decoded = decoder.decode(&payload).unwrap();
        assert_eq!(decoded.format(), codec.format());
        assert_eq!(decoded.samples_per_channel(), 960);

        let concealed = decoder.conceal(960).unwrap();
        assert_eq!(concealed.samples_per_channel(), 960);
    }
}
