//! Recovery packet wire format and sequence number compression.
//!
//! Wire format of a recovery packet (little-endian):
//!
//! ```text
//! bytes 0..3   SequenceStart: low 24 bits of the oldest covered sequence
//! byte  3      Count: originals covered, 1..=192
//! byte  4      RecoveryRow: Cauchy row index, 0..=63
//! bytes 5..    payload: GF(256) mix of (length prefix || data || zeros)
//!              per covered original; payload length = 2 + max data length
//! ```
//!
//! Originals have no CCat-defined wire format; the caller carries the full
//! 64-bit sequence in its own protocol. Recovery packets only ship the low
//! 24 bits of their start sequence, and the receiver unwraps them against
//! the highest sequence it has seen.

use crate::{Error, ENCODE_OVERHEAD, MATRIX_COLUMN_COUNT, MATRIX_ROW_COUNT, MAX_PACKET_BYTES};

/// Serialized recovery header size.
pub const RECOVERY_HEADER_BYTES: usize = 5;

const SEQ_MASK_24: u32 = 0x00ff_ffff;
const SEQ_HALF_RANGE_24: u32 = 1 << 23;

/// A recovery packet: header fields plus the mixed payload.
///
/// Produced by [`Encoder::emit_recovery`](crate::Encoder::emit_recovery)
/// and consumed by [`Decoder::on_recovery`](crate::Decoder::on_recovery);
/// [`write`](Self::write) and [`parse`](Self::parse) convert to and from
/// the wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPacket {
    /// Low 24 bits of the first covered original's sequence number.
    pub sequence_start: u32,
    /// Number of originals covered, 1..=192.
    pub count: u8,
    /// Cauchy matrix row index, 0..=63.
    pub row: u8,
    /// GF-mixed payload, `2 + max(len)` bytes.
    pub payload: Vec<u8>,
}

impl RecoveryPacket {
    /// Total serialized size in bytes.
    #[inline]
    pub fn serialized_bytes(&self) -> usize {
        RECOVERY_HEADER_BYTES + self.payload.len()
    }

    /// Field-level sanity checks shared by the encoder output path and the
    /// decoder input path.
    pub fn validate(&self) -> Result<(), Error> {
        if self.count == 0 || self.count as usize > MATRIX_COLUMN_COUNT {
            return Err(Error::InvalidInput);
        }
        if self.row as usize >= MATRIX_ROW_COUNT {
            return Err(Error::InvalidInput);
        }
        if self.sequence_start > SEQ_MASK_24 {
            return Err(Error::InvalidInput);
        }
        // Payload must hold the length prefix plus at least one data byte,
        // and no original exceeds the packet limit.
        if self.payload.len() <= ENCODE_OVERHEAD
            || self.payload.len() > ENCODE_OVERHEAD + MAX_PACKET_BYTES
        {
            return Err(Error::InvalidInput);
        }
        Ok(())
    }

    /// Append the wire form to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence_start.to_le_bytes()[..3]);
        out.push(self.count);
        out.push(self.row);
        out.extend_from_slice(&self.payload);
    }

    /// Parse a wire buffer. Returns `None` for anything malformed.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() <= RECOVERY_HEADER_BYTES + ENCODE_OVERHEAD {
            return None;
        }
        let packet = Self {
            sequence_start: u32::from_le_bytes([buf[0], buf[1], buf[2], 0]),
            count: buf[3],
            row: buf[4],
            payload: buf[RECOVERY_HEADER_BYTES..].to_vec(),
        };
        packet.validate().ok()?;
        Some(packet)
    }
}

/// Low 24 bits of a full sequence number, as carried on the wire.
#[inline]
pub(crate) fn truncate_sequence(sequence: u64) -> u32 {
    sequence as u32 & SEQ_MASK_24
}

/// Reconstruct a full 64-bit sequence from its low 24 wire bits.
///
/// The signed half-range rule: a delta in (-2^23, +2^23] from `recent`
/// selects the nearest 64-bit value congruent to `partial`. Backward
/// deltas clamp at zero near the start of a stream.
#[inline]
pub(crate) fn expand_sequence(partial: u32, recent: u64) -> u64 {
    debug_assert!(partial <= SEQ_MASK_24);
    let delta = partial.wrapping_sub(recent as u32) & SEQ_MASK_24;
    if delta <= SEQ_HALF_RANGE_24 {
        recent.wrapping_add(delta as u64)
    } else {
        recent.saturating_sub((SEQ_MASK_24 - delta + 1) as u64)
    }
}

/// Encode a data length into the in-band prefix. `bytes` is never zero,
/// so 65536 wraps to 0 without ambiguity.
#[inline]
pub(crate) fn encode_length_prefix(bytes: usize) -> [u8; 2] {
    debug_assert!(bytes >= 1 && bytes <= MAX_PACKET_BYTES);
    (bytes as u16).to_le_bytes()
}

/// Decode an in-band length prefix back to a data length.
#[inline]
pub(crate) fn decode_length_prefix(prefix: [u8; 2]) -> usize {
    match u16::from_le_bytes(prefix) {
        0 => MAX_PACKET_BYTES,
        n => n as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let packet = RecoveryPacket {
            sequence_start: 0x00abcdef,
            count: 192,
            row: 63,
            payload: vec![1, 2, 3, 4, 5],
        };
        let mut wire = Vec::new();
        packet.write(&mut wire);
        assert_eq!(wire.len(), packet.serialized_bytes());
        assert_eq!(&wire[..5], &[0xef, 0xcd, 0xab, 192, 63]);

        let parsed = RecoveryPacket::parse(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn parse_rejects_malformed() {
        // Too short to carry any data.
        assert!(RecoveryPacket::parse(&[0, 0, 0, 1, 0, 9, 9]).is_none());
        // Count out of range.
        assert!(RecoveryPacket::parse(&[0, 0, 0, 0, 0, 9, 9, 9]).is_none());
        assert!(RecoveryPacket::parse(&[0, 0, 0, 193, 0, 9, 9, 9]).is_none());
        // Row out of range.
        assert!(RecoveryPacket::parse(&[0, 0, 0, 1, 64, 9, 9, 9]).is_none());
    }

    #[test]
    fn sequence_truncation() {
        assert_eq!(truncate_sequence(0), 0);
        assert_eq!(truncate_sequence(0x0123_4567_89ab_cdef), 0x00ab_cdef);
    }

    #[test]
    fn expand_forward_and_backward() {
        assert_eq!(expand_sequence(5, 3), 5);
        assert_eq!(expand_sequence(3, 5), 3);

        // Forward across a 24-bit wrap.
        let recent = 0x00ff_fffe;
        assert_eq!(expand_sequence(2, recent), 0x0100_0002);

        // Backward across a 24-bit wrap.
        let recent = 0x0100_0001;
        assert_eq!(expand_sequence(0x00ff_fffd, recent), 0x00ff_fffd);
    }

    #[test]
    fn expand_half_range_boundary() {
        // Exactly +2^23 goes forward; one past goes backward.
        let recent = 0x0500_0000u64;
        assert_eq!(expand_sequence(1 << 23, recent), recent + (1 << 23));
        assert_eq!(
            expand_sequence((1 << 23) + 1, recent),
            recent - ((1 << 23) - 1)
        );
    }

    #[test]
    fn expand_clamps_before_stream_start() {
        // A stale-looking value near sequence zero cannot go negative.
        assert_eq!(expand_sequence(0x00ff_ffff, 0), 0);
    }

    #[test]
    fn length_prefix_roundtrip() {
        for bytes in [1usize, 2, 1000, 65535, 65536] {
            assert_eq!(decode_length_prefix(encode_length_prefix(bytes)), bytes);
        }
    }
}
