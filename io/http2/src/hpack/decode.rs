//! HPACK header block decoding.

use std::fmt;

use super::huffman::{self, HuffmanError};
use super::table::{DynamicTable, HeaderField, StaticTable};

/// HPACK decoding error. Any of these is a COMPRESSION_ERROR on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
    /// The block ended inside a representation.
    Incomplete,
    /// An integer overflowed 32 bits.
    IntegerOverflow,
    /// A Huffman-coded string was malformed.
    Huffman(HuffmanError),
    /// Index 0 or past the end of both tables.
    InvalidIndex(usize),
    /// A size update above the negotiated limit.
    TableSizeExceeded { requested: usize, limit: usize },
    /// A size update after the first header field of the block.
    MisplacedSizeUpdate,
}

impl fmt::Display for HpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HpackError::Incomplete => write!(f, "truncated header block"),
            HpackError::IntegerOverflow => write!(f, "integer overflow"),
            HpackError::Huffman(e) => write!(f, "bad huffman string: {}", e),
            HpackError::InvalidIndex(index) => write!(f, "invalid index {}", index),
            HpackError::TableSizeExceeded { requested, limit } => {
                write!(f, "table size update {} exceeds limit {}", requested, limit)
            }
            HpackError::MisplacedSizeUpdate => {
                write!(f, "table size update after first header field")
            }
        }
    }
}

impl std::error::Error for HpackError {}

impl From<HuffmanError> for HpackError {
    fn from(e: HuffmanError) -> Self {
        HpackError::Huffman(e)
    }
}

/// Decodes header blocks for one direction of a connection.
///
/// The decoder owns its dynamic table; every block on the connection must be
/// passed through it in order, including blocks for streams that are ignored.
#[derive(Debug)]
pub struct HpackDecoder {
    table: DynamicTable,
    /// Upper bound for size updates: the HEADER_TABLE_SIZE we advertised and
    /// the peer acknowledged.
    limit: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self::with_table_size(super::DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(size: usize) -> Self {
        Self {
            table: DynamicTable::new(size),
            limit: size,
        }
    }

    /// Apply an acknowledged HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.limit = size;
        if self.table.max_size() > size {
            self.table.set_max_size(size);
        }
    }

    pub fn max_table_size(&self) -> usize {
        self.limit
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut rest = block;

        while let Some(&first) = rest.first() {
            let consumed = if first & 0x80 != 0 {
                let (index, n) = decode_integer(rest, 7)?;
                fields.push(self.lookup(index)?);
                n
            } else if first & 0x40 != 0 {
                let (field, n) = self.decode_literal(rest, 6)?;
                self.table.insert(field.clone());
                fields.push(field);
                n
            } else if first & 0x20 != 0 {
                if !fields.is_empty() {
                    return Err(HpackError::MisplacedSizeUpdate);
                }
                let (size, n) = decode_integer(rest, 5)?;
                if size > self.limit {
                    return Err(HpackError::TableSizeExceeded {
                        requested: size,
                        limit: self.limit,
                    });
                }
                self.table.set_max_size(size);
                n
            } else {
                // without indexing (0000) and never indexed (0001)
                let (field, n) = self.decode_literal(rest, 4)?;
                fields.push(field);
                n
            };
            rest = &rest[consumed..];
        }

        Ok(fields)
    }

    fn decode_literal(
        &self,
        data: &[u8],
        prefix_bits: u8,
    ) -> Result<(HeaderField, usize), HpackError> {
        let (index, mut consumed) = decode_integer(data, prefix_bits)?;
        let name = if index == 0 {
            let (name, n) = decode_string(&data[consumed..])?;
            consumed += n;
            name
        } else {
            self.lookup(index)?.name
        };
        let (value, n) = decode_string(&data[consumed..])?;
        Ok((HeaderField { name, value }, consumed + n))
    }

    fn lookup(&self, index: usize) -> Result<HeaderField, HpackError> {
        if let Some((name, value)) = StaticTable::get(index) {
            return Ok(HeaderField::new(name, value));
        }
        index
            .checked_sub(StaticTable::LEN + 1)
            .and_then(|i| self.table.get(i))
            .cloned()
            .ok_or(HpackError::InvalidIndex(index))
    }
}

/// Decode a prefixed integer (RFC 7541 5.1). Returns `(value, consumed)`.
pub fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    let first = *data.first().ok_or(HpackError::Incomplete)?;
    let mask = (1usize << prefix_bits) - 1;
    let mut value = first as usize & mask;
    if value < mask {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate().skip(1) {
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
        value = value
            .checked_add(((byte & 0x7f) as usize) << shift)
            .ok_or(HpackError::IntegerOverflow)?;
        if value > u32::MAX as usize {
            return Err(HpackError::IntegerOverflow);
        }
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(HpackError::Incomplete)
}

/// Decode a string literal (RFC 7541 5.2). Returns `(octets, consumed)`.
pub fn decode_string(data: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    let first = *data.first().ok_or(HpackError::Incomplete)?;
    let (len, header) = decode_integer(data, 7)?;
    let end = header.checked_add(len).ok_or(HpackError::Incomplete)?;
    let raw = data.get(header..end).ok_or(HpackError::Incomplete)?;

    if first & 0x80 != 0 {
        let mut out = Vec::with_capacity(len * 8 / 5);
        huffman::decode(raw, &mut out)?;
        Ok((out, end))
    } else {
        Ok((raw.to_vec(), end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integer_rfc_examples() {
        // RFC 7541 C.1
        assert_eq!(decode_integer(&[0x0a], 5).unwrap(), (10, 1));
        assert_eq!(decode_integer(&[0x1f, 0x9a, 0x0a], 5).unwrap(), (1337, 3));
        assert_eq!(decode_integer(&[0x2a], 8).unwrap(), (42, 1));
    }

    #[test]
    fn test_decode_integer_truncated() {
        assert_eq!(decode_integer(&[0x1f, 0x9a], 5), Err(HpackError::Incomplete));
        assert_eq!(decode_integer(&[], 5), Err(HpackError::Incomplete));
    }

    #[test]
    fn test_decode_integer_overflow() {
        let data = [0x1f, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0f];
        assert_eq!(decode_integer(&data, 5), Err(HpackError::IntegerOverflow));
    }

    #[test]
    fn test_decode_request_without_huffman() {
        // RFC 7541 C.3.1
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x0f, b'w', b'w', b'w', b'.', b'e', b'x', b'a', b'm', b'p',
            b'l', b'e', b'.', b'c', b'o', b'm',
        ];
        let mut decoder = HpackDecoder::new();
        let fields = decoder.decode(&block).unwrap();
        assert_eq!(
            fields,
            vec![
                HeaderField::new(":method", "GET"),
                HeaderField::new(":scheme", "http"),
                HeaderField::new(":path", "/"),
                HeaderField::new(":authority", "www.example.com"),
            ]
        );

        // second request reuses :authority from the dynamic table (index 62)
        let fields = decoder.decode(&[0x82, 0x86, 0x84, 0xbe]).unwrap();
        assert_eq!(fields[3], HeaderField::new(":authority", "www.example.com"));
    }

    #[test]
    fn test_decode_huffman_literal() {
        // RFC 7541 C.4.1
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let fields = HpackDecoder::new().decode(&block).unwrap();
        assert_eq!(fields[3].value, b"www.example.com");
    }

    #[test]
    fn test_decode_literal_not_indexed_leaves_table() {
        // literal without indexing, new name
        let block = [0x00, 0x01, b'a', 0x01, b'b'];
        let mut decoder = HpackDecoder::new();
        assert_eq!(decoder.decode(&block).unwrap(), vec![HeaderField::new("a", "b")]);
        assert_eq!(decoder.decode(&[0xbe]), Err(HpackError::InvalidIndex(62)));
    }

    #[test]
    fn test_decode_size_update() {
        let mut decoder = HpackDecoder::with_table_size(256);
        assert!(decoder.decode(&[0x3f, 0xe1, 0x01]).is_ok()); // 256
        assert_eq!(
            decoder.decode(&[0x3f, 0xe2, 0x01]),
            Err(HpackError::TableSizeExceeded {
                requested: 257,
                limit: 256
            })
        );
        assert_eq!(decoder.decode(&[0x82, 0x20]), Err(HpackError::MisplacedSizeUpdate));
    }

    #[test]
    fn test_decode_invalid_index() {
        assert_eq!(HpackDecoder::new().decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
    }

    #[test]
    fn test_decode_truncated_string() {
        assert_eq!(
            HpackDecoder::new().decode(&[0x40, 0x05, b'a']),
            Err(HpackError::Incomplete)
        );
    }
}
