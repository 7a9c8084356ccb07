//! Length-prefixed message framing.
//!
//! Each message on a stream is a 1-byte compressed flag, a 4-byte
//! big-endian length and the payload. Messages may span DATA frames and a
//! DATA frame may carry several messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Compressed flag plus length.
pub const HEADER_SIZE: usize = 5;

/// Default limit on a received message (4 MiB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("received message of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("compressed message received but no compression was negotiated")]
    Compressed,
    #[error("stream ended inside a message ({0} bytes buffered)")]
    Truncated(usize),
}

/// Append `payload` as one uncompressed message.
pub fn encode_message(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Reassembles messages from DATA payloads.
#[derive(Debug)]
pub struct MessageDecoder {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl MessageDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete message payload, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, MessageError> {
        let Some(header) = self.buffer.first_chunk::<HEADER_SIZE>() else {
            return Ok(None);
        };
        if header[0] != 0 {
            return Err(MessageError::Compressed);
        }
        let size = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if size > self.max_message_size {
            return Err(MessageError::TooLarge {
                size,
                max: self.max_message_size,
            });
        }
        if self.buffer.len() < HEADER_SIZE + size {
            return Ok(None);
        }
        self.buffer.advance(HEADER_SIZE);
        Ok(Some(self.buffer.split_to(size).freeze()))
    }

    /// Called at end of stream: leftover bytes mean a truncated message.
    pub fn finish(&self) -> Result<(), MessageError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(MessageError::Truncated(self.buffer.len()))
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut buf = BytesMut::new();
        encode_message(b"hi", &mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_decoder_across_feeds() {
        let mut wire = BytesMut::new();
        encode_message(b"first", &mut wire);
        encode_message(b"", &mut wire);
        encode_message(b"third", &mut wire);

        let mut decoder = MessageDecoder::default();
        decoder.feed(&wire[..3]);
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.feed(&wire[3..12]);
        assert_eq!(decoder.next_message().unwrap().as_deref(), Some(&b"first"[..]));
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.feed(&wire[12..]);
        assert_eq!(decoder.next_message().unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(decoder.next_message().unwrap().as_deref(), Some(&b"third"[..]));
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decoder_limits() {
        let mut decoder = MessageDecoder::new(4);
        decoder.feed(&[0, 0, 0, 0, 5]);
        assert_eq!(
            decoder.next_message(),
            Err(MessageError::TooLarge { size: 5, max: 4 })
        );

        let mut decoder = MessageDecoder::default();
        decoder.feed(&[1, 0, 0, 0, 0]);
        assert_eq!(decoder.next_message(), Err(MessageError::Compressed));
    }

    #[test]
    fn test_decoder_truncated() {
        let mut decoder = MessageDecoder::default();
        decoder.feed(&[0, 0, 0, 0, 9, 1, 2]);
        assert_eq!(decoder.next_message().unwrap(), None);
        assert_eq!(decoder.finish(), Err(MessageError::Truncated(7)));
    }
}
