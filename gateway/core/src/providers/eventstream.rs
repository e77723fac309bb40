//! Binary Event-Stream Frames
//!
//! Wire format used by the Bedrock streaming API
//! (`application/vnd.amazon.eventstream`).
//!
//! # Frame Format
//!
//! ```text
//! +-------------+---------------+-------------+-----------+-----------+-------------+
//! | Total (4)   | Headers (4)   | Prelude     | Headers   | Payload   | Message     |
//! | big-endian  | big-endian    | CRC32 (4)   | (var)     | (var)     | CRC32 (4)   |
//! +-------------+---------------+-------------+-----------+-----------+-------------+
//! ```
//!
//! The prelude CRC covers the first 8 bytes; the message CRC covers
//! everything before it. Each header is `name_len(1) name type(1) value`.

use std::collections::HashMap;

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Total length + headers length + prelude CRC
const PRELUDE_SIZE: usize = 12;

/// Trailing message CRC
const TRAILER_SIZE: usize = 4;

/// Errors decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Declared length is outside the legal range
    #[error("frame length {0} out of range")]
    BadLength(usize),
    /// A checksum did not match
    #[error("{which} checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// `prelude` or `message`
        which: &'static str,
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum computed locally
        actual: u32,
    },
    /// Header block could not be parsed
    #[error("malformed header block: {0}")]
    BadHeaders(String),
}

/// Header value; only string-typed values are kept as text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Type 7
    String(String),
    /// Any other type, kept raw
    Other(Vec<u8>),
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Headers by name
    pub headers: HashMap<String, HeaderValue>,
    /// Raw payload (JSON for Bedrock)
    pub payload: Vec<u8>,
}

impl Frame {
    /// String header lookup
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        match self.headers.get(name) {
            Some(HeaderValue::String(s)) => Some(s),
            _ => None,
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Width of a fixed-size header value, or `None` for length-prefixed types
fn fixed_width(value_type: u8) -> Result<Option<usize>, FrameError> {
    Ok(match value_type {
        0 | 1 => Some(0),
        2 => Some(1),
        3 => Some(2),
        4 => Some(4),
        5 | 8 => Some(8),
        9 => Some(16),
        6 | 7 => None,
        other => return Err(FrameError::BadHeaders(format!("unknown value type {other}"))),
    })
}

fn parse_headers(mut block: &[u8]) -> Result<HashMap<String, HeaderValue>, FrameError> {
    let short = || FrameError::BadHeaders("truncated header".into());
    let mut headers = HashMap::new();

    while !block.is_empty() {
        let name_len = *block.first().ok_or_else(short)? as usize;
        let name_bytes = block.get(1..1 + name_len).ok_or_else(short)?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|e| FrameError::BadHeaders(e.to_string()))?;
        block = &block[1 + name_len..];

        let value_type = *block.first().ok_or_else(short)?;
        block = &block[1..];

        let value = match fixed_width(value_type)? {
            Some(width) => {
                let raw = block.get(..width).ok_or_else(short)?;
                let value = HeaderValue::Other(raw.to_vec());
                block = &block[width..];
                value
            }
            None => {
                let len_bytes = block.get(..2).ok_or_else(short)?;
                let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                let raw = block.get(2..2 + len).ok_or_else(short)?;
                let value = if value_type == 7 {
                    HeaderValue::String(
                        String::from_utf8(raw.to_vec())
                            .map_err(|e| FrameError::BadHeaders(e.to_string()))?,
                    )
                } else {
                    HeaderValue::Other(raw.to_vec())
                };
                block = &block[2 + len..];
                value
            }
        };
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Encode a frame with string headers
///
/// The gateway only reads frames; this exists so adapters and tests can
/// produce well-formed input.
///
/// # Errors
///
/// Returns [`FrameError::BadHeaders`] if a header name is longer than 255
/// bytes or a value longer than 65535 bytes, and [`FrameError::BadLength`]
/// if the frame would not fit the 32-bit length field.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut header_block = Vec::new();
    for (name, value) in headers {
        let name_len = u8::try_from(name.len())
            .map_err(|_| FrameError::BadHeaders(format!("header name '{name}' too long")))?;
        let value_len = u16::try_from(value.len())
            .map_err(|_| FrameError::BadHeaders(format!("value of '{name}' too long")))?;
        header_block.push(name_len);
        header_block.extend_from_slice(name.as_bytes());
        header_block.push(7);
        header_block.extend_from_slice(&value_len.to_be_bytes());
        header_block.extend_from_slice(value.as_bytes());
    }

    let total = PRELUDE_SIZE + header_block.len() + payload.len() + TRAILER_SIZE;
    let total_len = u32::try_from(total).map_err(|_| FrameError::BadLength(total))?;
    let headers_len =
        u32::try_from(header_block.len()).map_err(|_| FrameError::BadLength(total))?;

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&total_len.to_be_bytes());
    buf.extend_from_slice(&headers_len.to_be_bytes());
    let prelude_crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&prelude_crc.to_be_bytes());
    buf.extend_from_slice(&header_block);
    buf.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&message_crc.to_be_bytes());
    Ok(buf)
}

/// Decoder state machine for streaming frame parsing
///
/// Buffers incoming bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next frame
    ///
    /// Returns `Ok(None)` when more data is needed.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for out-of-range lengths, checksum mismatches,
    /// or malformed headers. The decoder should be discarded afterwards.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        let available = self.available();
        if available < PRELUDE_SIZE {
            return Ok(None);
        }

        let start = self.read_pos;
        let prelude = &self.buffer[start..start + PRELUDE_SIZE];
        let total = be_u32(&prelude[0..4]) as usize;
        let headers_len = be_u32(&prelude[4..8]) as usize;

        if total > MAX_FRAME_SIZE || total < PRELUDE_SIZE + TRAILER_SIZE + headers_len {
            return Err(FrameError::BadLength(total));
        }

        let expected = be_u32(&prelude[8..12]);
        let actual = crc32fast::hash(&prelude[0..8]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch {
                which: "prelude",
                expected,
                actual,
            });
        }

        if available < total {
            return Ok(None);
        }

        let frame = &self.buffer[start..start + total];
        let expected = be_u32(&frame[total - TRAILER_SIZE..]);
        let actual = crc32fast::hash(&frame[..total - TRAILER_SIZE]);
        if expected != actual {
            return Err(FrameError::ChecksumMismatch {
                which: "message",
                expected,
                actual,
            });
        }

        let headers_end = PRELUDE_SIZE + headers_len;
        let headers = parse_headers(&frame[PRELUDE_SIZE..headers_end])?;
        let payload = frame[headers_end..total - TRAILER_SIZE].to_vec();

        self.read_pos += total;
        Ok(Some(Frame { headers, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        encode_frame(
            &[(":message-type", "event"), (":event-type", "contentBlockDelta")],
            br#"{"contentBlockIndex":0,"delta":{"text":"hi"}}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_rejects_oversized_headers() {
        let long_name = "n".repeat(256);
        assert!(matches!(
            encode_frame(&[(long_name.as_str(), "v")], b"{}"),
            Err(FrameError::BadHeaders(_))
        ));

        let long_value = "v".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(
            encode_frame(&[(":event-type", long_value.as_str())], b"{}"),
            Err(FrameError::BadHeaders(_))
        ));

        let max_name = "n".repeat(255);
        let mut decoder = FrameDecoder::new();
        decoder.push(&encode_frame(&[(max_name.as_str(), "v")], b"{}").unwrap());
        assert_eq!(decoder.decode().unwrap().unwrap().header(&max_name), Some("v"));
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&sample());

        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame.header(":event-type"), Some("contentBlockDelta"));
        assert_eq!(frame.header(":message-type"), Some("event"));
        assert!(frame.payload.starts_with(b"{\"contentBlockIndex\""));
        assert_eq!(decoder.available(), 0);
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let bytes = [sample(), sample()].concat();
        let mut decoder = FrameDecoder::new();
        let mut frames = 0;
        for b in bytes {
            decoder.push(&[b]);
            while decoder.decode().unwrap().is_some() {
                frames += 1;
            }
        }
        assert_eq!(frames, 2);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut bytes = sample();
        let idx = bytes.len() - 8;
        bytes[idx] ^= 0xFF;

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.decode(),
            Err(FrameError::ChecksumMismatch { which: "message", .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let mut bytes = vec![0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(decoder.decode(), Err(FrameError::BadLength(_))));
    }

    #[test]
    fn test_non_string_headers_are_skipped_over() {
        // bool-true header followed by a string header
        let mut block = vec![4];
        block.extend_from_slice(b"flag");
        block.push(0);
        block.push(5);
        block.extend_from_slice(b"kind!");
        block.push(7);
        block.extend_from_slice(&2u16.to_be_bytes());
        block.extend_from_slice(b"ok");

        let headers = parse_headers(&block).unwrap();
        assert_eq!(headers.get("kind!"), Some(&HeaderValue::String("ok".into())));
        assert_eq!(headers.get("flag"), Some(&HeaderValue::Other(vec![])));
    }
}
