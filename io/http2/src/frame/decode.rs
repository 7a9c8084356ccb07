//! HTTP/2 frame decoding.
//!
//! Decoding is split in two steps so a caller can own the read state machine:
//! [`FrameDecoder::decode_header`] validates the 9-byte header and
//! [`FrameDecoder::decode_payload`] turns a complete payload into a [`Frame`].

use bytes::{Buf, Bytes, BytesMut};

use super::error::FrameError;
use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};

/// Parses frames from a byte buffer.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Largest payload accepted, i.e. our advertised SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Decode one frame if `buf` holds a complete one, consuming its bytes.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(header) = self.decode_header(buf)? else {
            return Ok(None);
        };
        let total = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();
        self.decode_payload(header, payload).map(Some)
    }

    /// Parse and size-check the header at the front of `buf` without consuming it.
    pub fn decode_header(&self, buf: &[u8]) -> Result<Option<FrameHeader>, FrameError> {
        let Some(raw) = buf.first_chunk::<FRAME_HEADER_SIZE>() else {
            return Ok(None);
        };
        let header = FrameHeader::parse(raw);
        if header.length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: header.length,
                max: self.max_frame_size,
            });
        }
        Ok(Some(header))
    }

    /// Interpret a complete payload according to `header`.
    pub fn decode_payload(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        let Some(kind) = header.kind() else {
            return Ok(Frame::Unknown(UnknownFrame {
                frame_type: header.frame_type,
                flags: header.flags,
                stream_id: header.stream_id,
                payload,
            }));
        };

        match kind {
            FrameType::Settings | FrameType::Ping | FrameType::GoAway => {
                if !header.stream_id.is_connection_level() {
                    return Err(FrameError::StreamIdNotAllowed {
                        frame_type: header.frame_type,
                    });
                }
            }
            FrameType::WindowUpdate => {}
            _ => {
                if header.stream_id.is_connection_level() {
                    return Err(FrameError::StreamIdRequired {
                        frame_type: header.frame_type,
                    });
                }
            }
        }

        match kind {
            FrameType::Data => data(header, payload),
            FrameType::Headers => headers(header, payload),
            FrameType::Priority => {
                let mut payload = exact(header, payload, 5)?;
                Ok(Frame::Priority(PriorityFrame {
                    stream_id: header.stream_id,
                    priority: priority(&mut payload),
                }))
            }
            FrameType::RstStream => {
                let mut payload = exact(header, payload, 4)?;
                Ok(Frame::RstStream(RstStreamFrame {
                    stream_id: header.stream_id,
                    error_code: payload.get_u32(),
                }))
            }
            FrameType::Settings => settings(header, payload),
            FrameType::PushPromise => {
                let mut payload = strip_padding(header, payload)?;
                at_least(header, &payload, 4)?;
                Ok(Frame::PushPromise(PushPromiseFrame {
                    stream_id: header.stream_id,
                    end_headers: header.has_flag(flags::END_HEADERS),
                    promised_stream_id: StreamId::new(payload.get_u32()),
                    header_block: payload,
                }))
            }
            FrameType::Ping => {
                let payload = exact(header, payload, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Frame::Ping(PingFrame {
                    ack: header.has_flag(flags::ACK),
                    data,
                }))
            }
            FrameType::GoAway => {
                at_least(header, &payload, 8)?;
                let mut payload = payload;
                let last_stream_id = StreamId::new(payload.get_u32());
                let error_code = payload.get_u32();
                Ok(Frame::GoAway(GoAwayFrame {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                }))
            }
            FrameType::WindowUpdate => {
                let mut payload = exact(header, payload, 4)?;
                let increment = payload.get_u32() & 0x7fff_ffff;
                if increment == 0 {
                    return Err(FrameError::ZeroWindowIncrement {
                        stream_id: header.stream_id.value(),
                    });
                }
                Ok(Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: header.stream_id,
                    increment,
                }))
            }
            FrameType::Continuation => Ok(Frame::Continuation(ContinuationFrame {
                stream_id: header.stream_id,
                end_headers: header.has_flag(flags::END_HEADERS),
                header_block: payload,
            })),
        }
    }
}

fn data(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let flow_controlled_len = header.length;
    let data = strip_padding(header, payload)?;
    Ok(Frame::Data(DataFrame {
        stream_id: header.stream_id,
        end_stream: header.has_flag(flags::END_STREAM),
        data,
        flow_controlled_len,
    }))
}

fn headers(header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    let mut payload = strip_padding(header, payload)?;
    let priority = if header.has_flag(flags::PRIORITY) {
        at_least(header, &payload, 5)?;
        Some(priority(&mut payload))
    } else {
        None
    };
    Ok(Frame::Headers(HeadersFrame {
        stream_id: header.stream_id,
        end_stream: header.has_flag(flags::END_STREAM),
        end_headers: header.has_flag(flags::END_HEADERS),
        priority,
        header_block: payload,
    }))
}

fn settings(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
    let ack = header.has_flag(flags::ACK);
    if ack && !payload.is_empty() {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: 0,
            actual: payload.len(),
        });
    }
    if payload.len() % 6 != 0 {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: payload.len() - payload.len() % 6,
            actual: payload.len(),
        });
    }

    let mut settings = Vec::with_capacity(payload.len() / 6);
    while payload.has_remaining() {
        let id = SettingId::from_u16(payload.get_u16());
        let value = payload.get_u32();
        let valid = match id {
            SettingId::EnablePush => value <= 1,
            SettingId::InitialWindowSize => value <= 0x7fff_ffff,
            SettingId::MaxFrameSize => (super::DEFAULT_MAX_FRAME_SIZE..=super::MAX_FRAME_SIZE)
                .contains(&value),
            _ => true,
        };
        if !valid {
            return Err(FrameError::InvalidSettingValue {
                id: id.to_u16(),
                value,
            });
        }
        settings.push(Setting { id, value });
    }
    Ok(Frame::Settings(SettingsFrame { ack, settings }))
}

fn priority(payload: &mut Bytes) -> Priority {
    let raw = payload.get_u32();
    Priority {
        exclusive: raw & 0x8000_0000 != 0,
        dependency: StreamId::new(raw),
        weight: payload.get_u8(),
    }
}

fn exact(header: FrameHeader, payload: Bytes, len: usize) -> Result<Bytes, FrameError> {
    if payload.len() != len {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: len,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

fn at_least(header: FrameHeader, payload: &Bytes, len: usize) -> Result<(), FrameError> {
    if payload.len() < len {
        return Err(FrameError::InvalidPayloadLength {
            frame_type: header.frame_type,
            expected: len,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn strip_padding(header: FrameHeader, mut payload: Bytes) -> Result<Bytes, FrameError> {
    if !header.has_flag(flags::PADDED) {
        return Ok(payload);
    }
    let payload_length = payload.len();
    if payload.is_empty() {
        return Err(FrameError::InvalidPadding {
            pad_length: 0,
            payload_length,
        });
    }
    let pad_length = payload.get_u8();
    if pad_length as usize > payload.len() {
        return Err(FrameError::InvalidPadding {
            pad_length,
            payload_length,
        });
    }
    payload.truncate(payload.len() - pad_length as usize);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let len = payload.len() as u32;
        buf.extend_from_slice(&len.to_be_bytes()[1..]);
        buf.extend_from_slice(&[frame_type, flags]);
        buf.extend_from_slice(&stream_id.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_decode_needs_more_bytes() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x0, 0, 1, b"hello");
        let mut partial = buf.split_to(10);
        assert!(decoder.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 10);
        assert!(decoder.decode(&mut BytesMut::from(&b"\x00\x00"[..])).unwrap().is_none());
    }

    #[test]
    fn test_decode_frame_too_large() {
        let decoder = FrameDecoder::new();
        let buf = [0x00, 0x40, 0x01, 0x0, 0x0, 0, 0, 0, 1];
        assert_eq!(
            decoder.decode_header(&buf),
            Err(FrameError::FrameTooLarge {
                size: 16385,
                max: 16384
            })
        );
    }

    #[test]
    fn test_decode_data_with_padding() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x0, flags::PADDED | flags::END_STREAM, 3, &[2, b'h', b'i', 0, 0]);
        let Frame::Data(data) = decoder.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected DATA");
        };
        assert_eq!(data.stream_id, StreamId::new(3));
        assert!(data.end_stream);
        assert_eq!(&data.data[..], b"hi");
        assert_eq!(data.flow_controlled_len, 5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_bad_padding() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x0, flags::PADDED, 1, &[9, b'x']);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::InvalidPadding { pad_length: 9, .. })
        ));
    }

    #[test]
    fn test_decode_data_on_stream_zero() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x0, 0, 0, b"x");
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::StreamIdRequired { frame_type: 0 }
        );
    }

    #[test]
    fn test_decode_headers_with_priority() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(
            0x1,
            flags::PRIORITY | flags::END_HEADERS,
            5,
            &[0x80, 0, 0, 3, 15, 0x82],
        );
        let Frame::Headers(headers) = decoder.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected HEADERS");
        };
        assert!(headers.end_headers);
        assert!(!headers.end_stream);
        let priority = headers.priority.unwrap();
        assert!(priority.exclusive);
        assert_eq!(priority.dependency, StreamId::new(3));
        assert_eq!(priority.weight, 15);
        assert_eq!(&headers.header_block[..], &[0x82]);
    }

    #[test]
    fn test_decode_settings() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x4, 0, 0, &[0, 3, 0, 0, 0, 100, 0, 4, 0, 1, 0, 0]);
        let Frame::Settings(settings) = decoder.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected SETTINGS");
        };
        assert!(!settings.ack);
        assert_eq!(
            settings.settings,
            vec![
                Setting {
                    id: SettingId::MaxConcurrentStreams,
                    value: 100
                },
                Setting {
                    id: SettingId::InitialWindowSize,
                    value: 65536
                },
            ]
        );
    }

    #[test]
    fn test_decode_settings_invalid() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x4, 0, 0, &[0, 2, 0, 0, 0, 2]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::InvalidSettingValue { id: 2, value: 2 }
        );

        let mut buf = frame(0x4, flags::ACK, 0, &[0, 2, 0, 0, 0, 0]);
        assert!(decoder.decode(&mut buf).is_err());

        let mut buf = frame(0x4, 0, 1, &[]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::StreamIdNotAllowed { frame_type: 4 }
        );
    }

    #[test]
    fn test_decode_ping_and_goaway() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x6, flags::ACK, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.extend_from_slice(&frame(0x7, 0, 0, &[0, 0, 0, 7, 0, 0, 0, 0, b'b', b'y', b'e']));

        let Frame::Ping(ping) = decoder.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected PING");
        };
        assert!(ping.ack);
        assert_eq!(ping.data, [1, 2, 3, 4, 5, 6, 7, 8]);

        let Frame::GoAway(goaway) = decoder.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected GOAWAY");
        };
        assert_eq!(goaway.last_stream_id, StreamId::new(7));
        assert_eq!(goaway.error_code, 0);
        assert_eq!(&goaway.debug_data[..], b"bye");
    }

    #[test]
    fn test_decode_window_update() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x8, 0, 0, &[0x80, 0, 0x10, 0]);
        let Frame::WindowUpdate(update) = decoder.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected WINDOW_UPDATE");
        };
        assert!(update.stream_id.is_connection_level());
        assert_eq!(update.increment, 4096);

        let mut buf = frame(0x8, 0, 1, &[0, 0, 0, 0]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::ZeroWindowIncrement { stream_id: 1 }
        );
    }

    #[test]
    fn test_decode_unknown_type_is_kept() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0xfa, 0x3, 9, b"ext");
        let Frame::Unknown(unknown) = decoder.decode(&mut buf).unwrap().unwrap() else {
            panic!("expected unknown frame");
        };
        assert_eq!(unknown.frame_type, 0xfa);
        assert_eq!(&unknown.payload[..], b"ext");
    }

    #[test]
    fn test_decode_rst_stream_wrong_length() {
        let decoder = FrameDecoder::new();
        let mut buf = frame(0x3, 0, 1, &[0, 0, 8]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::InvalidPayloadLength {
                frame_type: 3,
                expected: 4,
                actual: 3
            }
        );
    }
}
