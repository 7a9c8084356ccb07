//! Transport error type.
//!
//! Errors carry a message and optional attributes and may hold child errors,
//! so several failures of one operation can be reported together.

use grpc::{Code, MessageError};
use http2::{ErrorCode, FrameError, HpackError};
use std::time::Instant;

/// An error produced by the transport or surfaced to a stream.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    message: String,
    code: Option<Code>,
    http2_error: Option<ErrorCode>,
    http_status: Option<u16>,
    stream_id: Option<u32>,
    transparent_retry: bool,
    children: Vec<Error>,
}

impl Error {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            http2_error: None,
            http_status: None,
            stream_id: None,
            transparent_retry: false,
            children: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: Code) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_http2_error(mut self, error: ErrorCode) -> Self {
        self.http2_error = Some(error);
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_stream_id(mut self, stream_id: u32) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    /// Mark the failure as safe for a layer above to retry on another
    /// connection: the peer never processed the stream.
    pub fn with_transparent_retry(mut self) -> Self {
        self.transparent_retry = true;
        self
    }

    /// Error wrapping `children`, or `None` if there are none. A single
    /// child is returned unchanged.
    pub fn union(message: impl Into<String>, children: Vec<Error>) -> Option<Self> {
        match children.len() {
            0 => None,
            1 => children.into_iter().next(),
            _ => {
                let mut error = Error::new(message);
                error.children = children;
                Some(error)
            }
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<Code> {
        self.code
    }

    pub fn http_status(&self) -> Option<u16> {
        self.find(|e| e.http_status.is_some())
            .and_then(|e| e.http_status)
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.find(|e| e.stream_id.is_some()).and_then(|e| e.stream_id)
    }

    pub fn transparent_retry(&self) -> bool {
        self.find(|e| e.transparent_retry).is_some()
    }

    pub fn children(&self) -> &[Error] {
        &self.children
    }

    /// gRPC status for this error.
    ///
    /// An explicit code wins, then an HTTP/2 error code (a CANCEL or NO_ERROR
    /// reset only counts as DEADLINE_EXCEEDED once `deadline` has passed),
    /// then an HTTP status, otherwise UNKNOWN.
    pub fn status(&self, deadline: Option<Instant>) -> (Code, String) {
        if let Some(e) = self.find(|e| e.code.is_some()) {
            return (e.code.unwrap_or(Code::Unknown), e.message.clone());
        }
        if let Some(e) = self.find(|e| e.http2_error.is_some()) {
            let passed = deadline.is_some_and(|d| Instant::now() >= d);
            let code = e
                .http2_error
                .map_or(Code::Unknown, |h| Code::from_http2_error(h, passed));
            return (code, e.message.clone());
        }
        if let Some(e) = self.find(|e| e.http_status.is_some()) {
            let code = e.http_status.map_or(Code::Unknown, Code::from_http_status);
            return (code, e.message.clone());
        }
        (Code::Unknown, self.message.clone())
    }

    /// HTTP/2 error code to put in a RST_STREAM or GOAWAY for this error.
    pub fn http2_error(&self) -> ErrorCode {
        if let Some(code) = self.find(|e| e.http2_error.is_some()).and_then(|e| e.http2_error) {
            return code;
        }
        match self.find(|e| e.code.is_some()).and_then(|e| e.code) {
            Some(code) => code.to_http2_error(),
            None => ErrorCode::InternalError,
        }
    }

    fn find(&self, pred: impl Fn(&Error) -> bool + Copy) -> Option<&Error> {
        if pred(self) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(pred))
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::new(e.to_string()).with_http2_error(e.error_code())
    }
}

impl From<HpackError> for Error {
    fn from(e: HpackError) -> Self {
        Error::new(format!("hpack: {}", e)).with_http2_error(ErrorCode::CompressionError)
    }
}

impl From<MessageError> for Error {
    fn from(e: MessageError) -> Self {
        let code = match e {
            MessageError::TooLarge { .. } => Code::ResourceExhausted,
            MessageError::Compressed => Code::Unimplemented,
            MessageError::Truncated(_) => Code::Internal,
        };
        Error::new(e.to_string()).with_code(code)
    }
}
