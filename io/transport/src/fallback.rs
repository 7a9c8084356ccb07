//! Recognizing an HTTP/1.x response where HTTP/2 frames were expected.

use crate::error::Error;
use grpc::Code;

/// Parse `HTTP/1.x SP status [SP reason]` at the start of `buf`. The line
/// ending may not have arrived yet; the reason then runs to the end of `buf`.
pub fn parse_status_line(buf: &[u8]) -> Option<(u16, &[u8])> {
    let line = match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) => &buf[..end],
        None => buf,
    };
    let version = line.get(..9)?;
    if !version.starts_with(b"HTTP/1.") || !version[7].is_ascii_digit() || version[8] != b' ' {
        return None;
    }
    let rest = &line[9..];
    let digits = rest.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let status = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
    if status < 100 {
        return None;
    }
    let reason = match rest.get(3) {
        Some(b' ') => &rest[4..],
        Some(_) => return None,
        None => &[][..],
    };
    Some((status, reason))
}

/// Error for input that turned out to be an HTTP/1.x response, or `None`
/// if the input is just corrupt.
pub fn http1_error(buf: &[u8]) -> Option<Error> {
    let (status, _) = parse_status_line(buf)?;
    Some(
        Error::new("Trying to connect an http1.x server")
            .with_http_status(status)
            .with_code(Code::from_http_status(status)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 404 Not Found\r\n"),
            Some((404, &b"Not Found"[..]))
        );
        assert_eq!(parse_status_line(b"HTTP/1.0 200\r\n"), Some((200, &b""[..])));
    }

    #[test]
    fn test_status_line_without_line_ending() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK"), Some((200, &b"OK"[..])));
        assert_eq!(parse_status_line(b"HTTP/1.1 502"), Some((502, &b""[..])));
        assert_eq!(parse_status_line(b"HTTP/1.1 50"), None);
        assert!(http1_error(b"HTTP/1.1 404 Not Fo").is_some());
    }

    #[test]
    fn test_not_http1() {
        assert_eq!(parse_status_line(b"HTTP/2.0 200 OK\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 200OK\r\n"), None);
        assert_eq!(parse_status_line(b"\x00\x00\x04\x04\x00\x00\x00\x00\x00\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 0x1\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 099\r\n"), None);
    }

    #[test]
    fn test_error_carries_status() {
        let err = http1_error(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(err.status(None).0, Code::Unavailable);
        assert_eq!(err.message(), "Trying to connect an http1.x server");
    }
}
