//! WebSocket frame codec
//!
//! Pure decode/encode of the wire frame format. No I/O happens here: the
//! session hands in raw blocks read off the socket and gets back frames,
//! and the broadcaster hands in messages and gets back bytes to write.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key, if MASK set to 1     |     Payload Data      |
//! +---------------------------------------+-----------------------+
//! ```

use thiserror::Error;

/// FIN flag in the first header byte
const FIN_BIT: u8 = 0x80;
/// RSV1..RSV3 in the first header byte
const RESERVED_BITS: u8 = 0x70;
/// Opcode nibble in the first header byte
const OPCODE_BITS: u8 = 0x0F;
/// MASK flag in the second header byte
const MASK_BIT: u8 = 0x80;
/// Base payload length in the second header byte
const LENGTH_BITS: u8 = 0x7F;

/// Largest payload length carried directly in the base length field
pub const MAX_INLINE_LENGTH: u64 = 125;
/// Base length marker for a 2-byte extended length
pub const EXTENDED_16: u8 = 0x7E;
/// Base length marker for an 8-byte extended length
pub const EXTENDED_64: u8 = 0x7F;

/// Longest possible frame header (2 + 8 length + 4 mask key)
pub const MAX_HEADER_LEN: usize = 14;

/// Default upper bound on a single payload (16 MiB)
pub const DEFAULT_MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Frame decoding errors
///
/// Every variant is fatal to the connection that produced the bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set in frame header (0x{0:02X})")]
    ReservedBits(u8),

    #[error("unsupported opcode 0x{0:X}")]
    UnsupportedOpcode(u8),

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: u64, available: usize },

    #[error("invalid 64-bit payload length (most significant bit set)")]
    InvalidLength,

    #[error("payload length {length} exceeds limit {limit}")]
    PayloadTooLarge { length: u64, limit: u64 },
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

// ============================================================================
// Opcode
// ============================================================================

/// Frame opcodes understood by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
}

impl Opcode {
    /// Parse the low nibble of the first header byte
    pub fn from_bits(bits: u8) -> FrameResult<Self> {
        match bits {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            other => Err(FrameError::UnsupportedOpcode(other)),
        }
    }

    /// Wire value of this opcode
    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
        }
    }

    /// Control frames trigger protocol actions instead of carrying message data
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close)
    }
}

// ============================================================================
// Frame / Message
// ============================================================================

/// A single decoded protocol unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    pub opcode: Opcode,
    /// Whether the payload was XOR-masked on the wire
    pub masked: bool,
    /// Declared payload length
    pub payload_length: u64,
    /// Present iff `masked`
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode this frame for sending to a client
    ///
    /// Masking and the FIN flag of the decoded frame are not carried over:
    /// server frames are always final and unmasked.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.opcode, &self.payload)
    }
}

/// A complete logical message, reassembled from one or more frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Opcode of the first fragment
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Encode as a single unfragmented server frame
    pub fn encode(&self) -> Vec<u8> {
        encode(self.opcode, &self.payload)
    }
}

// ============================================================================
// Masking
// ============================================================================

/// XOR `payload` in place with the 4-byte mask key
///
/// Symmetric: applying the same key twice restores the input.
pub fn apply_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

// ============================================================================
// Decode
// ============================================================================

/// Borrow `len` bytes at `*offset`, advancing the offset
fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> FrameResult<&'a [u8]> {
    let end = *offset + len;
    if data.len() < end {
        return Err(FrameError::Truncated {
            needed: end as u64,
            available: data.len(),
        });
    }
    let bytes = &data[*offset..end];
    *offset = end;
    Ok(bytes)
}

/// Decode one frame from the front of `data`
///
/// Returns the frame and the number of bytes it occupied, so a caller
/// holding a block with several frames can keep decoding from there. A block
/// shorter than the header declares is a [`FrameError::Truncated`] error;
/// the decoder never waits for more bytes.
pub fn decode(data: &[u8], max_payload: u64) -> FrameResult<(Frame, usize)> {
    let mut offset = 0;
    let header = take(data, &mut offset, 2)?;
    let (first, second) = (header[0], header[1]);

    if first & RESERVED_BITS != 0 {
        return Err(FrameError::ReservedBits(first & RESERVED_BITS));
    }
    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::from_bits(first & OPCODE_BITS)?;

    let masked = second & MASK_BIT != 0;
    let payload_length = match second & LENGTH_BITS {
        EXTENDED_16 => {
            let bytes = take(data, &mut offset, 2)?;
            u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
        }
        EXTENDED_64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(take(data, &mut offset, 8)?);
            let length = u64::from_be_bytes(buf);
            if length >> 63 != 0 {
                return Err(FrameError::InvalidLength);
            }
            length
        }
        base => u64::from(base),
    };

    if payload_length > max_payload {
        return Err(FrameError::PayloadTooLarge {
            length: payload_length,
            limit: max_payload,
        });
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        key.copy_from_slice(take(data, &mut offset, 4)?);
        Some(key)
    } else {
        None
    };

    let wanted = usize::try_from(payload_length).map_err(|_| FrameError::PayloadTooLarge {
        length: payload_length,
        limit: max_payload,
    })?;
    let mut payload = take(data, &mut offset, wanted)?.to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin,
        opcode,
        masked,
        payload_length,
        mask_key,
        payload,
    };
    Ok((frame, offset))
}

// ============================================================================
// Encode
// ============================================================================

/// Encode a final, unmasked server frame
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u64;
    let mut out = Vec::with_capacity(payload.len() + MAX_HEADER_LEN);
    out.push(FIN_BIT | opcode.bits());

    if len <= MAX_INLINE_LENGTH {
        out.push(len as u8);
    } else if len <= u64::from(u16::MAX) {
        out.push(EXTENDED_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(EXTENDED_64);
        out.extend_from_slice(&len.to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

/// Build a client-style frame: optional mask, explicit FIN
#[cfg(test)]
pub(crate) fn client_frame(
    opcode: Opcode,
    fin: bool,
    payload: &[u8],
    mask_key: Option<[u8; 4]>,
) -> Vec<u8> {
    let mut out = encode(opcode, payload);
    if !fin {
        out[0] &= !FIN_BIT;
    }
    if let Some(key) = mask_key {
        out[1] |= MASK_BIT;
        let header_len = out.len() - payload.len();
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, key);
        out.truncate(header_len);
        out.extend_from_slice(&key);
        out.extend_from_slice(&masked);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Masking
    // -------------------------------------------------------------------------

    #[test]
    fn test_mask_roundtrip() {
        let original = b"Hello, hub".to_vec();
        for key in [[0x37, 0xfa, 0x21, 0x3d], [0, 0, 0, 0], [0xff; 4]] {
            let mut data = original.clone();
            apply_mask(&mut data, key);
            apply_mask(&mut data, key);
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_rfc_masked_hello() {
        // RFC 6455 section 5.7: single-frame masked text message "Hello"
        let bytes = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (frame, consumed) = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(frame.fin);
        assert!(frame.masked);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.mask_key, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(frame.payload_length, 5);
        assert_eq!(frame.payload, b"Hello");
    }

    #[test]
    fn test_decode_unmasked() {
        let bytes = [0x82, 0x03, 1, 2, 3];
        let (frame, _) = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert!(!frame.masked);
        assert!(frame.mask_key.is_none());
        assert_eq!(frame.payload, vec![1, 2, 3]);
    }

    // -------------------------------------------------------------------------
    // Length encoding
    // -------------------------------------------------------------------------

    #[test]
    fn test_length_boundaries() {
        let cases: [(usize, usize); 6] = [
            (0, 2),
            (125, 2),
            (126, 4),
            (65535, 4),
            (65536, 10),
            (200_000, 10),
        ];

        for (len, header_len) in cases {
            let payload = vec![0x5Au8; len];
            let bytes = encode(Opcode::Binary, &payload);
            assert_eq!(bytes.len(), header_len + len, "header size for {len}");

            match header_len {
                2 => assert_eq!(bytes[1] as usize, len),
                4 => {
                    assert_eq!(bytes[1], EXTENDED_16);
                    assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, len);
                }
                _ => {
                    assert_eq!(bytes[1], EXTENDED_64);
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&bytes[2..10]);
                    assert_eq!(u64::from_be_bytes(buf) as usize, len);
                }
            }

            let (frame, consumed) = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(frame.payload_length as usize, len);
            assert_eq!(frame.payload.len(), len);
        }
    }

    #[test]
    fn test_decode_masked_extended_lengths() {
        let key = [9, 8, 7, 6];
        for len in [126usize, 300, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let bytes = client_frame(Opcode::Binary, true, &payload, Some(key));
            let (frame, consumed) = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn test_encode_small_frame() {
        let bytes = encode(Opcode::Text, b"Hello");
        assert_eq!(bytes, vec![0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_never_masks() {
        let bytes = Message::new(Opcode::Binary, vec![1u8; 300]).encode();
        assert_eq!(bytes[0], 0x82);
        assert_eq!(bytes[1] & MASK_BIT, 0);
    }

    #[test]
    fn test_frame_to_bytes_ignores_fin_and_mask() {
        let bytes = client_frame(Opcode::Text, false, b"abc", Some([1, 2, 3, 4]));
        let (frame, _) = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(frame.to_bytes(), vec![0x81, 0x03, b'a', b'b', b'c']);
    }

    // -------------------------------------------------------------------------
    // Errors
    // -------------------------------------------------------------------------

    #[test]
    fn test_reserved_bits_rejected() {
        for first in [0xC1u8, 0xA1, 0x91, 0xF1] {
            let result = decode(&[first, 0x00], DEFAULT_MAX_PAYLOAD);
            assert!(matches!(result, Err(FrameError::ReservedBits(_))));
        }
    }

    #[test]
    fn test_unsupported_opcode() {
        for op in [0x3u8, 0x9, 0xA, 0xF] {
            let result = decode(&[0x80 | op, 0x00], DEFAULT_MAX_PAYLOAD);
            assert_eq!(result.unwrap_err(), FrameError::UnsupportedOpcode(op));
        }
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            decode(&[0x81], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::Truncated { needed: 2, available: 1 })
        ));
        // 16-bit length announced, only one byte follows
        assert!(matches!(
            decode(&[0x81, 0x7E, 0x01], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::Truncated { .. })
        ));
        // mask bit set, key cut short
        assert!(matches!(
            decode(&[0x81, 0x81, 1, 2], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = client_frame(Opcode::Text, true, b"hello world", Some([1, 1, 1, 1]));
        bytes.truncate(bytes.len() - 3);
        let err = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                needed: 17,
                available: 14
            }
        );
    }

    #[test]
    fn test_payload_limit() {
        let bytes = encode(Opcode::Binary, &[0u8; 200]);
        let err = decode(&bytes, 100).unwrap_err();
        assert_eq!(
            err,
            FrameError::PayloadTooLarge {
                length: 200,
                limit: 100
            }
        );
    }

    #[test]
    fn test_64bit_length_msb_rejected() {
        let mut bytes = vec![0x82, 0x7F];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert_eq!(
            decode(&bytes, u64::MAX).unwrap_err(),
            FrameError::InvalidLength
        );
    }

    #[test]
    fn test_decode_reports_consumed_with_trailing_frame() {
        let mut bytes = client_frame(Opcode::Text, true, b"one", Some([4, 3, 2, 1]));
        let first_len = bytes.len();
        bytes.extend(client_frame(Opcode::Text, true, b"two", None));

        let (first, consumed) = decode(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(first.payload, b"one");

        let (second, _) = decode(&bytes[consumed..], DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(second.payload, b"two");
    }

    #[test]
    fn test_opcode_bits() {
        for op in [
            Opcode::Continuation,
            Opcode::Text,
            Opcode::Binary,
            Opcode::Close,
        ] {
            assert_eq!(Opcode::from_bits(op.bits()).unwrap(), op);
        }
        assert!(Opcode::Close.is_control());
        assert!(!Opcode::Text.is_control());
    }
}
