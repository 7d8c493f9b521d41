//! Opus codec with inband FEC, in low-delay mode.

use anyhow::{Context, Result};
use opus::{Application, Bitrate, Channels};

const OPUS_EXPECTED_PACKET_LOSS: i32 = 10;
const MAX_OPUS_PACKET_SIZE: usize = 4000;
/// 120 ms at 48 kHz.
const MAX_FRAME_SIZE: usize = 5760;

const VALID_FRAME_DURATIONS_MS: [f64; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];

pub fn is_valid_opus_frame_size(samples_per_channel: usize, sample_rate: u32) -> bool {
    VALID_FRAME_DURATIONS_MS
        .iter()
        .any(|&ms| (sample_rate as f64 * ms / 1000.0) as usize == samples_per_channel)
}

fn channels_to_opus(channels: u16) -> Result<Channels> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => anyhow::bail!("Opus only supports 1 or 2 channels, got {}", channels),
    }
}

pub struct OpusEncoder {
    encoder: opus::Encoder,
    sample_rate: u32,
    channels: u16,
    output_buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32, channels: u16, bitrate: i32) -> Result<Self> {
        let mut encoder = opus::Encoder::new(
            sample_rate,
            channels_to_opus(channels)?,
            Application::LowDelay,
        )
        .context("Failed to create Opus encoder")?;

        encoder
            .set_bitrate(Bitrate::Bits(bitrate))
            .context("Failed to set bitrate")?;
        encoder
            .set_inband_fec(true)
            .context("Failed to enable FEC")?;
        encoder
            .set_packet_loss_perc(OPUS_EXPECTED_PACKET_LOSS)
            .context("Failed to set packet loss percentage")?;

        Ok(Self {
            encoder,
            sample_rate,
            channels,
            output_buffer: vec![0u8; MAX_OPUS_PACKET_SIZE],
        })
    }

    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let samples_per_channel = pcm.len() / self.channels as usize;
        if !is_valid_opus_frame_size(samples_per_channel, self.sample_rate) {
            anyhow::bail!(
                "Invalid Opus frame size: {} samples/channel at {} Hz",
                samples_per_channel,
                self.sample_rate
            );
        }
        let len = self
            .encoder
            .encode(pcm, &mut self.output_buffer)
            .context("Opus encoding failed")?;
        Ok(self.output_buffer[..len].to_vec())
    }
}

pub struct OpusDecoder {
    decoder: opus::Decoder,
    channels: u16,
    output_buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let decoder = opus::Decoder::new(sample_rate, channels_to_opus(channels)?)
            .context("Failed to create Opus decoder")?;
        Ok(Self {
            decoder,
            channels,
            output_buffer: vec![0i16; MAX_FRAME_SIZE * channels as usize],
        })
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>> {
        let samples_per_channel = self
            .decoder
            .decode(data, &mut self.output_buffer, false)
            .context("Opus decoding failed")?;
        Ok(self.output_buffer[..samples_per_channel * self.channels as usize].to_vec())
    }

    /// Packet loss concealment for one missing frame.
    pub fn decode_missing(&mut self, samples_per_channel: usize) -> Result<Vec<i16>> {
        let len = (samples_per_channel * self.channels as usize).min(self.output_buffer.len());
        let decoded = self
            .decoder
            .decode(&[], &mut self.output_buffer[..len], false)
            .context("Opus PLC failed")?;
        Ok(self.output_buffer[..decoded * self.channels as usize].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_roundtrip() {
        let mut encoder = OpusEncoder::new(48000, 2, 64000).unwrap();
        let mut decoder = OpusDecoder::new(48000, 2).unwrap();

        let samples: Vec<i16> = (0..960 * 2).map(|i| (i as i16) % 1000).collect();
        let encoded = encoder.encode(&samples).unwrap();
        assert!(encoded.len() < samples.len() * 2);

        let decoded = decoder.decode(&encoded).unwrap();
        assert_eq!(decoded.len(), samples.len());
    }

    #[test]
    fn test_invalid_frame_size_is_rejected() {
        let mut encoder = OpusEncoder::new(48000, 1, 64000).unwrap();
        assert!(encoder.encode(&[0i16; 1000]).is_err());
        assert!(is_valid_opus_frame_size(160, 8000));
        assert!(!is_valid_opus_frame_size(161, 8000));
    }

    #[test]
    fn test_unsupported_channel_count() {
        assert!(OpusEncoder::new(48000, 3, 64000).is_err());
    }

    #[test]
    fn test_plc_produces_requested_length() {
        let mut decoder = OpusDecoder::new(48000, 1).unwrap();
        let concealed = decoder.decode_missing(960).unwrap();
        assert_eq!(concealed.len(), 960);
    }
}
