//! Linear 16-bit PCM in network byte order (L16).

use crate::error::{PipelineError, Result};

pub fn encode(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_be_bytes()).collect()
}

pub fn decode(payload: &[u8], channels: u16) -> Result<Vec<i16>> {
    let bytes_per_frame = 2 * channels.max(1) as usize;
    if payload.len() % bytes_per_frame != 0 {
        return Err(PipelineError::Codec(format!(
            "L16 payload of {} bytes is not a multiple of {}",
            payload.len(),
            bytes_per_frame
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .collect())
}
