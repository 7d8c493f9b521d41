//! RTP packet value carried between sender and receiver.

use rkyv::{Archive, Deserialize, Serialize};
use rkyv::util::AlignedVec;

use crate::error::{PipelineError, Result};

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(compare(PartialEq))]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    /// Media clock, in samples per channel.
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| PipelineError::Transport(format!("Failed to serialize packet: {e}")))?;
        Ok(bytes.to_vec())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        // received buffers carry no alignment guarantee
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<RtpPacket, rkyv::rancor::Error>(&aligned)
            .map_err(|e| PipelineError::Transport(format!("Failed to deserialize packet: {e}")))
    }
}

/// Bytes on the wire for a packet carrying `payload_len` payload bytes.
pub fn datagram_size(payload_len: usize) -> Result<usize> {
    let packet = RtpPacket {
        payload_type: 0,
        marker: false,
        sequence: 0,
        timestamp: 0,
        ssrc: 0,
        payload: vec![0; payload_len],
    };
    Ok(packet.serialize()?.len())
}

/// Packets missing between `prev` and `next`, on the 16-bit sequence circle.
/// Reordered or duplicate packets count as no loss.
pub fn sequence_gap(prev: u16, next: u16) -> u16 {
    let delta = next.wrapping_sub(prev);
    if delta == 0 || delta >= 0x8000 { 0 } else { delta - 1 }
}
