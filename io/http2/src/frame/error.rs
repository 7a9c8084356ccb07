//! HTTP/2 error codes and frame-level errors.

use std::fmt;

/// Error codes carried by RST_STREAM and GOAWAY (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes are treated as INTERNAL_ERROR.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame that could not be decoded. All of these are connection errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared length exceeds SETTINGS_MAX_FRAME_SIZE.
    FrameTooLarge { size: u32, max: u32 },
    /// A connection-level frame arrived on a stream.
    StreamIdNotAllowed { frame_type: u8 },
    /// A stream-level frame arrived on stream 0.
    StreamIdRequired { frame_type: u8 },
    InvalidPayloadLength {
        frame_type: u8,
        expected: usize,
        actual: usize,
    },
    InvalidPadding { pad_length: u8, payload_length: usize },
    InvalidSettingValue { id: u16, value: u32 },
    ZeroWindowIncrement { stream_id: u32 },
}

impl FrameError {
    /// Code to put in the GOAWAY that follows this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            FrameError::FrameTooLarge { .. } | FrameError::InvalidPayloadLength { .. } => {
                ErrorCode::FrameSizeError
            }
            FrameError::InvalidSettingValue { id: 0x4, .. } => ErrorCode::FlowControlError,
            _ => ErrorCode::ProtocolError,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::FrameTooLarge { size, max } => {
                write!(f, "frame of {} bytes exceeds max frame size {}", size, max)
            }
            FrameError::StreamIdNotAllowed { frame_type } => {
                write!(f, "frame type 0x{:02x} must be sent on stream 0", frame_type)
            }
            FrameError::StreamIdRequired { frame_type } => {
                write!(f, "frame type 0x{:02x} not allowed on stream 0", frame_type)
            }
            FrameError::InvalidPayloadLength {
                frame_type,
                expected,
                actual,
            } => write!(
                f,
                "frame type 0x{:02x} has {} byte payload, expected {}",
                frame_type, actual, expected
            ),
            FrameError::InvalidPadding {
                pad_length,
                payload_length,
            } => write!(
                f,
                "pad length {} does not fit {} byte payload",
                pad_length, payload_length
            ),
            FrameError::InvalidSettingValue { id, value } => {
                write!(f, "setting 0x{:x} has invalid value {}", id, value)
            }
            FrameError::ZeroWindowIncrement { stream_id } => {
                write!(f, "zero window increment on stream {}", stream_id)
            }
        }
    }
}

impl std::error::Error for FrameError {}
