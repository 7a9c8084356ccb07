//! HPACK header compression (RFC 7541).
//!
//! Encoder and decoder each own a dynamic table; both are stateful for the
//! life of a connection and must see every header block in wire order.

mod decode;
mod encode;
mod huffman;
pub mod literal;
mod table;

pub use decode::{HpackDecoder, HpackError, decode_integer, decode_string};
pub use encode::{HpackEncoder, encode_integer};
pub use huffman::HuffmanError;
pub use table::{DynamicTable, ENTRY_OVERHEAD, HeaderField, Match, StaticTable};

/// Default dynamic table size (4096 bytes).
pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Size of a header list as counted against SETTINGS_MAX_HEADER_LIST_SIZE.
pub fn header_list_size(fields: &[HeaderField]) -> usize {
    fields.iter().map(HeaderField::size).sum()
}
