//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   authentication tag (AEAD ciphers only)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` excludes itself and the tag
//! - Padding is 4..=255 random bytes
//! - Without a cipher, `4 + packet_length` is a multiple of 8
//! - With an AEAD cipher the length stays in clear, so only `packet_length`
//!   is aligned to the cipher block size (RFC 5647 Section 7.2)
//! - `packet_length` never exceeds [`MAX_PACKET_SIZE`]
//!
//! [`seal_packet`] and [`open_packet`] apply a [`PacketCipher`] around these
//! rules. [`open_packet`] works on an accumulating buffer: it returns
//! `Ok(None)` until a whole record has arrived, so a short socket read never
//! leaks a partial record upward.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use ferrule_proto::ssh::packet::{open_packet, seal_packet, MAX_PACKET_SIZE};
//!
//! let record = seal_packet(b"payload", None, 0).unwrap();
//!
//! // Deliver the record in two pieces.
//! let mut inbound = BytesMut::from(&record[..3]);
//! assert_eq!(open_packet(&mut inbound, None, 0, MAX_PACKET_SIZE).unwrap(), None);
//! inbound.extend_from_slice(&record[3..]);
//! let payload = open_packet(&mut inbound, None, 0, MAX_PACKET_SIZE).unwrap();
//! assert_eq!(payload.as_deref(), Some(&b"payload"[..]));
//! ```

use bytes::{Buf, BufMut, BytesMut};
use ferrule_platform::{CryptoError, PacketCipher};
use rand::RngCore;
use thiserror::Error;

/// Maximum `packet_length` accepted or produced (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes.
pub const MAX_PADDING_LEN: usize = 255;

/// Alignment used before any cipher is installed.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// Framing failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Payload cannot fit in one packet.
    #[error("payload of {0} bytes does not fit in one packet")]
    TooLarge(usize),
    /// Declared `packet_length` is out of range.
    #[error("packet length {length} outside 5..={max}")]
    BadLength {
        /// Declared length
        length: usize,
        /// Limit in force
        max: usize,
    },
    /// Declared length is not aligned to the block size.
    #[error("packet length {length} is not aligned to block size {block_size}")]
    Misaligned {
        /// Declared length
        length: usize,
        /// Required alignment
        block_size: usize,
    },
    /// Padding length outside 4..=255 or larger than the packet.
    #[error("invalid padding length {0}")]
    BadPadding(usize),
    /// Authentication tag did not verify.
    #[error("record authentication failed")]
    Integrity,
    /// Cipher failure other than a tag mismatch.
    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// One plaintext SSH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Pads `payload` for the unencrypted transport (8-byte alignment,
    /// length field included).
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooLarge`] if the result would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn new(payload: Vec<u8>) -> Result<Self, PacketError> {
        Self::with_alignment(payload, DEFAULT_BLOCK_SIZE, false)
    }

    /// Pads `payload` to `block_size`.
    ///
    /// When `length_in_clear` is set the 4-byte length field is excluded from
    /// the alignment, as AEAD ciphers require.
    pub fn with_alignment(
        payload: Vec<u8>,
        block_size: usize,
        length_in_clear: bool,
    ) -> Result<Self, PacketError> {
        let block_size = block_size.max(DEFAULT_BLOCK_SIZE);
        let unpadded = if length_in_clear { 1 } else { 5 } + payload.len();

        let mut padding_len = block_size - unpadded % block_size;
        if padding_len < MIN_PADDING_LEN {
            padding_len += block_size;
        }
        if padding_len > MAX_PADDING_LEN || 1 + payload.len() + padding_len > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(payload.len()));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Random padding.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes `packet_length || padding_length || payload || padding`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses exactly one plaintext record.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the declared lengths are inconsistent with
    /// `data` or the padding is out of range.
    pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < 5 {
            return Err(PacketError::BadLength {
                length: data.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        if !(5..=MAX_PACKET_SIZE).contains(&packet_length) || buf.len() != packet_length {
            return Err(PacketError::BadLength {
                length: packet_length,
                max: MAX_PACKET_SIZE,
            });
        }

        let padding_length = buf.get_u8() as usize;
        if padding_length < MIN_PADDING_LEN || padding_length > packet_length - 1 {
            return Err(PacketError::BadPadding(padding_length));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        let padding = buf[payload_length..].to_vec();

        Ok(Self { payload, padding })
    }
}

/// Frames and, if a cipher is installed, encrypts one outgoing payload.
pub fn seal_packet(
    payload: &[u8],
    cipher: Option<&mut Box<dyn PacketCipher>>,
    sequence: u32,
) -> Result<Vec<u8>, PacketError> {
    match cipher {
        None => Ok(Packet::new(payload.to_vec())?.to_bytes()),
        Some(cipher) => {
            let packet = Packet::with_alignment(payload.to_vec(), cipher.block_size(), true)?;
            let mut record = packet.to_bytes();
            cipher
                .seal(sequence, &mut record)
                .map_err(|e| PacketError::Cipher(e.to_string()))?;
            Ok(record)
        }
    }
}

/// Removes one complete record from the front of `buffer` and returns its
/// payload.
///
/// Returns `Ok(None)` if `buffer` does not yet hold a whole record; the
/// buffer is left untouched in that case. The declared length is validated
/// before waiting for the body, so a hostile length cannot make the caller
/// buffer more than `max_packet` bytes.
///
/// # Errors
///
/// [`PacketError::Integrity`] when the tag does not verify, other variants
/// for framing violations. Both leave the stream unusable.
pub fn open_packet(
    buffer: &mut BytesMut,
    cipher: Option<&mut Box<dyn PacketCipher>>,
    sequence: u32,
    max_packet: usize,
) -> Result<Option<Vec<u8>>, PacketError> {
    if buffer.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if !(5..=max_packet).contains(&length) {
        return Err(PacketError::BadLength {
            length,
            max: max_packet,
        });
    }

    let (block_size, aligned, tag_len) = match cipher.as_deref() {
        Some(cipher) => (
            cipher.block_size().max(DEFAULT_BLOCK_SIZE),
            length,
            cipher.tag_len(),
        ),
        None => (DEFAULT_BLOCK_SIZE, 4 + length, 0),
    };
    if aligned % block_size != 0 {
        return Err(PacketError::Misaligned { length, block_size });
    }

    let total = 4 + length + tag_len;
    if buffer.len() < total {
        return Ok(None);
    }

    let mut record = buffer.split_to(total).to_vec();
    if let Some(cipher) = cipher {
        cipher.open(sequence, &mut record).map_err(|e| match e {
            CryptoError::Integrity => PacketError::Integrity,
            other => PacketError::Cipher(other.to_string()),
        })?;
    }

    Packet::from_bytes(&record).map(|packet| Some(packet.into_payload()))
}
