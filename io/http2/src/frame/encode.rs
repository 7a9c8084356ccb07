//! HTTP/2 frame encoding.

use bytes::{BufMut, BytesMut};

use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};

/// Serializes frames into an outbound buffer.
///
/// Header blocks larger than the peer's max frame size are split into
/// HEADERS + CONTINUATION by [`FrameEncoder::write_headers`].
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// The peer's SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Encode an already-built frame. Header blocks are written as given.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => self.write_data(f.stream_id, f.end_stream, &f.data, buf),
            Frame::Headers(f) => {
                let mut flags = 0;
                if f.end_stream {
                    flags |= flags::END_STREAM;
                }
                if f.end_headers {
                    flags |= flags::END_HEADERS;
                }
                let mut len = f.header_block.len() as u32;
                if f.priority.is_some() {
                    flags |= flags::PRIORITY;
                    len += 5;
                }
                write_header(buf, len, FrameType::Headers, flags, f.stream_id);
                if let Some(priority) = f.priority {
                    put_priority(buf, priority);
                }
                buf.extend_from_slice(&f.header_block);
            }
            Frame::Priority(f) => {
                write_header(buf, 5, FrameType::Priority, 0, f.stream_id);
                put_priority(buf, f.priority);
            }
            Frame::RstStream(f) => self.write_rst_stream(f.stream_id, f.error_code, buf),
            Frame::Settings(f) if f.ack => self.write_settings_ack(buf),
            Frame::Settings(f) => self.write_settings(&f.settings, buf),
            Frame::PushPromise(f) => {
                let flags = if f.end_headers { flags::END_HEADERS } else { 0 };
                let len = 4 + f.header_block.len() as u32;
                write_header(buf, len, FrameType::PushPromise, flags, f.stream_id);
                buf.put_u32(f.promised_stream_id.value());
                buf.extend_from_slice(&f.header_block);
            }
            Frame::Ping(f) => self.write_ping(f.ack, f.data, buf),
            Frame::GoAway(f) => {
                self.write_goaway(f.last_stream_id, f.error_code, &f.debug_data, buf)
            }
            Frame::WindowUpdate(f) => self.write_window_update(f.stream_id, f.increment, buf),
            Frame::Continuation(f) => {
                let flags = if f.end_headers { flags::END_HEADERS } else { 0 };
                let len = f.header_block.len() as u32;
                write_header(buf, len, FrameType::Continuation, flags, f.stream_id);
                buf.extend_from_slice(&f.header_block);
            }
            Frame::Unknown(f) => {
                buf.reserve(FRAME_HEADER_SIZE + f.payload.len());
                buf.put_uint(f.payload.len() as u64, 3);
                buf.put_u8(f.frame_type);
                buf.put_u8(f.flags);
                buf.put_u32(f.stream_id.value());
                buf.extend_from_slice(&f.payload);
            }
        }
    }

    /// One DATA frame. The caller keeps `data` within the max frame size.
    pub fn write_data(&self, stream_id: StreamId, end_stream: bool, data: &[u8], buf: &mut BytesMut) {
        let flags = if end_stream { flags::END_STREAM } else { 0 };
        write_header(buf, data.len() as u32, FrameType::Data, flags, stream_id);
        buf.extend_from_slice(data);
    }

    /// A complete header block: one HEADERS frame followed by as many
    /// CONTINUATION frames as the max frame size requires.
    pub fn write_headers(
        &self,
        stream_id: StreamId,
        end_stream: bool,
        block: &[u8],
        buf: &mut BytesMut,
    ) {
        let max = self.max_frame_size as usize;
        let mut chunks = block.chunks(max.max(1)).peekable();
        let first = chunks.next().unwrap_or(&[]);

        let mut flags = if end_stream { flags::END_STREAM } else { 0 };
        if chunks.peek().is_none() {
            flags |= flags::END_HEADERS;
        }
        write_header(buf, first.len() as u32, FrameType::Headers, flags, stream_id);
        buf.extend_from_slice(first);

        while let Some(chunk) = chunks.next() {
            let flags = if chunks.peek().is_none() {
                flags::END_HEADERS
            } else {
                0
            };
            write_header(buf, chunk.len() as u32, FrameType::Continuation, flags, stream_id);
            buf.extend_from_slice(chunk);
        }
    }

    pub fn write_rst_stream(&self, stream_id: StreamId, error_code: u32, buf: &mut BytesMut) {
        write_header(buf, 4, FrameType::RstStream, 0, stream_id);
        buf.put_u32(error_code);
    }

    pub fn write_settings(&self, settings: &[Setting], buf: &mut BytesMut) {
        let len = (settings.len() * 6) as u32;
        write_header(buf, len, FrameType::Settings, 0, StreamId::CONNECTION);
        for setting in settings {
            buf.put_u16(setting.id.to_u16());
            buf.put_u32(setting.value);
        }
    }

    pub fn write_settings_ack(&self, buf: &mut BytesMut) {
        write_header(buf, 0, FrameType::Settings, flags::ACK, StreamId::CONNECTION);
    }

    pub fn write_ping(&self, ack: bool, data: [u8; 8], buf: &mut BytesMut) {
        let flags = if ack { flags::ACK } else { 0 };
        write_header(buf, 8, FrameType::Ping, flags, StreamId::CONNECTION);
        buf.extend_from_slice(&data);
    }

    pub fn write_goaway(
        &self,
        last_stream_id: StreamId,
        error_code: u32,
        debug_data: &[u8],
        buf: &mut BytesMut,
    ) {
        let len = 8 + debug_data.len() as u32;
        write_header(buf, len, FrameType::GoAway, 0, StreamId::CONNECTION);
        buf.put_u32(last_stream_id.value());
        buf.put_u32(error_code);
        buf.extend_from_slice(debug_data);
    }

    pub fn write_window_update(&self, stream_id: StreamId, increment: u32, buf: &mut BytesMut) {
        write_header(buf, 4, FrameType::WindowUpdate, 0, stream_id);
        buf.put_u32(increment & 0x7fff_ffff);
    }
}

fn write_header(buf: &mut BytesMut, len: u32, kind: FrameType, flags: u8, stream_id: StreamId) {
    buf.reserve(FRAME_HEADER_SIZE + len as usize);
    buf.put_uint(len as u64, 3);
    buf.put_u8(kind as u8);
    buf.put_u8(flags);
    buf.put_u32(stream_id.value());
}

fn put_priority(buf: &mut BytesMut, priority: Priority) {
    let mut dependency = priority.dependency.value();
    if priority.exclusive {
        dependency |= 0x8000_0000;
    }
    buf.put_u32(dependency);
    buf.put_u8(priority.weight);
}

#[cfg(test)]
mod tests {
    use super::super::FrameDecoder;
    use super::*;

    #[test]
    fn test_write_data_layout() {
        let mut buf = BytesMut::new();
        FrameEncoder::new().write_data(StreamId::new(1), true, b"abc", &mut buf);
        assert_eq!(&buf[..], &[0, 0, 3, 0x0, 0x1, 0, 0, 0, 1, b'a', b'b', b'c']);
    }

    #[test]
    fn test_write_settings_layout() {
        let mut buf = BytesMut::new();
        let settings = [Setting {
            id: SettingId::MaxHeaderListSize,
            value: 16384,
        }];
        FrameEncoder::new().write_settings(&settings, &mut buf);
        assert_eq!(&buf[..], &[0, 0, 6, 0x4, 0, 0, 0, 0, 0, 0, 6, 0, 0, 0x40, 0]);
    }

    #[test]
    fn test_write_headers_splits_into_continuations() {
        let mut encoder = FrameEncoder::new();
        encoder.set_max_frame_size(4);
        let mut buf = BytesMut::new();
        encoder.write_headers(StreamId::new(3), true, &[1, 2, 3, 4, 5, 6, 7, 8, 9], &mut buf);

        let decoder = FrameDecoder::new();
        let Some(Frame::Headers(headers)) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected HEADERS");
        };
        assert!(headers.end_stream);
        assert!(!headers.end_headers);
        assert_eq!(&headers.header_block[..], &[1, 2, 3, 4]);

        let Some(Frame::Continuation(second)) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected CONTINUATION");
        };
        assert!(!second.end_headers);
        let Some(Frame::Continuation(third)) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected CONTINUATION");
        };
        assert!(third.end_headers);
        assert_eq!(&third.header_block[..], &[9]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_headers_empty_block() {
        let mut buf = BytesMut::new();
        FrameEncoder::new().write_headers(StreamId::new(1), false, &[], &mut buf);
        assert_eq!(&buf[..], &[0, 0, 0, 0x1, 0x4, 0, 0, 0, 1]);
    }

    #[test]
    fn test_encode_decode_control_frames() {
        let encoder = FrameEncoder::new();
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        encoder.write_goaway(StreamId::new(5), 0xb, b"calm", &mut buf);
        encoder.write_window_update(StreamId::new(5), 1024, &mut buf);
        encoder.write_rst_stream(StreamId::new(5), 8, &mut buf);
        encoder.write_settings_ack(&mut buf);

        assert!(matches!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::GoAway(GoAwayFrame { error_code: 0xb, .. }))
        ));
        assert!(matches!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::WindowUpdate(WindowUpdateFrame { increment: 1024, .. }))
        ));
        assert!(matches!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::RstStream(RstStreamFrame { error_code: 8, .. }))
        ));
        assert!(matches!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::Settings(SettingsFrame { ack: true, .. }))
        ));
    }
}
