//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Reading goes through [`Reader`], a bounds-checked cursor over a payload.
//! Writing goes through [`SshBufMut`], an extension of [`bytes::BufMut`].

use bytes::BufMut;
use thiserror::Error;

/// Decoding failure for SSH wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The payload ended before `field` could be read.
    #[error("truncated {field} at offset {offset}")]
    Truncated {
        /// Field being decoded
        field: &'static str,
        /// Byte offset where decoding stopped
        offset: usize,
    },

    /// A text field was not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    Utf8 {
        /// Field being decoded
        field: &'static str,
    },

    /// The message type byte did not match.
    #[error("expected message {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message number
        expected: u8,
        /// Received message number
        actual: u8,
    },

    /// A field held a value outside its domain.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Field being decoded
        field: &'static str,
        /// What was wrong
        reason: String,
    },
}

/// Bounds-checked cursor over an SSH payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Starts reading a message, checking its type byte.
    pub fn message(data: &'a [u8], expected: u8) -> Result<Self, WireError> {
        let mut reader = Self::new(data);
        let actual = reader.read_u8("message type")?;
        if actual != expected {
            return Err(WireError::UnexpectedMessage { expected, actual });
        }
        Ok(reader)
    }

    /// Current offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    /// Reads `len` raw bytes.
    pub fn read_raw(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(WireError::Truncated {
                field,
                offset: self.offset,
            })?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.read_raw(1, field)?[0])
    }

    /// Reads a `boolean`.
    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, WireError> {
        Ok(self.read_u8(field)? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        let bytes = self.read_raw(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a `string` as raw bytes.
    pub fn read_string(&mut self, field: &'static str) -> Result<&'a [u8], WireError> {
        let len = self.read_u32(field)? as usize;
        self.read_raw(len, field)
    }

    /// Reads a `string` that must be UTF-8.
    pub fn read_utf8(&mut self, field: &'static str) -> Result<&'a str, WireError> {
        let bytes = self.read_string(field)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::Utf8 { field })
    }

    /// Reads a `name-list`.
    pub fn read_name_list(&mut self, field: &'static str) -> Result<Vec<String>, WireError> {
        let text = self.read_utf8(field)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split(',').map(String::from).collect())
    }
}

/// Writers for SSH data types.
pub trait SshBufMut: BufMut {
    /// Writes a `string`.
    fn put_ssh_string(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }

    /// Writes a `boolean`.
    fn put_ssh_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Writes a `name-list`.
    fn put_name_list(&mut self, names: &[String]) {
        self.put_ssh_string(names.join(",").as_bytes());
    }

    /// Writes an unsigned big-endian integer as an `mpint`.
    fn put_mpint(&mut self, magnitude: &[u8]) {
        let start = magnitude
            .iter()
            .position(|b| *b != 0)
            .unwrap_or(magnitude.len());
        let trimmed = &magnitude[start..];
        if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
            self.put_u32(trimmed.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(trimmed.len() as u32);
        }
        self.put_slice(trimmed);
    }
}

impl<B: BufMut> SshBufMut for B {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_string_and_u32() {
        let mut buf = Vec::new();
        buf.put_ssh_string(b"exec");
        buf.put_u32(7);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_string("name").unwrap(), b"exec");
        assert_eq!(reader.read_u32("value").unwrap(), 7);
        assert!(reader.remaining().is_empty());
    }

    #[test]
    fn test_truncated_string_reports_offset() {
        let data = [0, 0, 0, 10, b'a', b'b'];
        let mut reader = Reader::new(&data);
        assert_eq!(
            reader.read_string("command"),
            Err(WireError::Truncated {
                field: "command",
                offset: 4
            })
        );
    }

    #[test]
    fn test_oversized_length_does_not_overflow() {
        let data = [0xff, 0xff, 0xff, 0xff];
        let mut reader = Reader::new(&data);
        assert!(reader.read_string("blob").is_err());
    }

    #[test]
    fn test_name_list() {
        let mut buf = Vec::new();
        buf.put_name_list(&["a".to_string(), "b".to_string()]);
        buf.put_name_list(&[]);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_name_list("first").unwrap(), vec!["a", "b"]);
        assert!(reader.read_name_list("second").unwrap().is_empty());
    }

    #[test]
    fn test_mpint_encoding() {
        let mut buf = Vec::new();
        buf.put_mpint(&[0x00, 0x00, 0x7f]);
        assert_eq!(buf, vec![0, 0, 0, 1, 0x7f]);

        let mut buf = Vec::new();
        buf.put_mpint(&[0x80, 0x01]);
        assert_eq!(buf, vec![0, 0, 0, 3, 0x00, 0x80, 0x01]);

        let mut buf = Vec::new();
        buf.put_mpint(&[0, 0]);
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_message_type_check() {
        let data = [94u8, 0, 0, 0, 1];
        assert!(Reader::message(&data, 94).is_ok());
        assert_eq!(
            Reader::message(&data, 95).unwrap_err(),
            WireError::UnexpectedMessage {
                expected: 95,
                actual: 94
            }
        );
    }
}
