//! http2 - HTTP/2 framing and HPACK for the RPC transport.
//!
//! This crate is sans-io: it turns bytes into frames and header lists and
//! back, and leaves connection state to the transport that drives it. It
//! does not use async/await or tokio.
//!
//! - `frame`: frame types, [`FrameDecoder`] and [`FrameEncoder`]
//! - `hpack`: header compression, including the literal fast path used for
//!   status trailers

pub mod frame;
pub mod hpack;

pub use frame::{
    CONNECTION_PREFACE, ContinuationFrame, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE, DataFrame, ErrorCode, FRAME_HEADER_SIZE, Frame, FrameDecoder,
    FrameEncoder, FrameError, FrameHeader, FrameType, GoAwayFrame, HeadersFrame, MAX_FRAME_SIZE,
    MAX_WINDOW_SIZE, PingFrame, Priority, RstStreamFrame, Setting, SettingId, SettingsFrame,
    StreamId, WindowUpdateFrame, flags,
};

pub use hpack::{HeaderField, HpackDecoder, HpackEncoder, HpackError};
