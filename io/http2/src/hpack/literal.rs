//! Hand-encoded header fields for status trailers.
//!
//! Each field is written as a literal with incremental indexing and a new
//! name: `0x40`, then the length-prefixed name, then the length-prefixed
//! value, neither Huffman coded. The peer inserts every such field into its
//! dynamic table, so the caller must mirror them into the connection's
//! [`HpackEncoder`](super::HpackEncoder) with `note_inserted`.

use super::encode::encode_integer;
use super::table::HeaderField;

/// Append one literal field to `buf` and return it for mirroring.
pub fn encode_literal(name: &[u8], value: &[u8], buf: &mut Vec<u8>) -> HeaderField {
    buf.push(0x40);
    encode_integer(name.len(), 7, 0x00, buf);
    buf.extend_from_slice(name);
    encode_integer(value.len(), 7, 0x00, buf);
    buf.extend_from_slice(value);
    HeaderField::new(name, value)
}

/// Block announcing a gRPC status: `grpc-status` and `grpc-message`, optionally
/// preceded by `:status: 200` and `content-type: application/grpc` when no
/// response headers were sent before.
pub fn encode_status_block(
    with_response_headers: bool,
    status: u32,
    message: &str,
    buf: &mut Vec<u8>,
) -> Vec<HeaderField> {
    let mut inserted = Vec::with_capacity(4);
    if with_response_headers {
        inserted.push(encode_literal(b":status", b"200", buf));
        inserted.push(encode_literal(b"content-type", b"application/grpc", buf));
    }
    inserted.push(encode_literal(b"grpc-status", status.to_string().as_bytes(), buf));
    inserted.push(encode_literal(b"grpc-message", message.as_bytes(), buf));
    inserted
}
