//! HPACK header block encoding.

use super::huffman;
use super::table::{DynamicTable, HeaderField, Match, StaticTable};

/// Encodes header blocks for one direction of a connection.
#[derive(Debug)]
pub struct HpackEncoder {
    table: DynamicTable,
    /// Largest table this side is willing to use, whatever the peer allows.
    cap: usize,
    /// Size update owed at the start of the next block.
    pending_update: Option<usize>,
    use_huffman: bool,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self::with_table_size(super::DEFAULT_TABLE_SIZE)
    }

    /// Encoder whose table never grows beyond `cap` bytes.
    pub fn with_table_size(cap: usize) -> Self {
        let initial = cap.min(super::DEFAULT_TABLE_SIZE);
        Self {
            table: DynamicTable::new(initial),
            cap,
            pending_update: (initial != super::DEFAULT_TABLE_SIZE).then_some(initial),
            use_huffman: true,
        }
    }

    pub fn set_huffman(&mut self, use_huffman: bool) {
        self.use_huffman = use_huffman;
    }

    /// Apply the peer's HEADER_TABLE_SIZE. The effective size is bounded by the
    /// local cap and announced at the start of the next block.
    pub fn set_peer_table_size(&mut self, peer: usize) {
        let size = peer.min(self.cap);
        if size != self.table.max_size() {
            self.table.set_max_size(size);
            self.pending_update = Some(size);
        }
    }

    pub fn table_size(&self) -> usize {
        self.table.max_size()
    }

    /// Emit an owed dynamic table size update. Blocks built outside this
    /// encoder must start with it.
    pub fn flush_size_update(&mut self, buf: &mut Vec<u8>) {
        if let Some(size) = self.pending_update.take() {
            encode_integer(size, 5, 0x20, buf);
        }
    }

    /// Encode `fields` as one header block.
    pub fn encode(&mut self, fields: &[HeaderField], buf: &mut Vec<u8>) {
        self.flush_size_update(buf);
        for field in fields {
            self.encode_field(field, buf);
        }
    }

    /// Record a field the peer will insert because it was sent as a literal
    /// with incremental indexing outside this encoder.
    pub fn note_inserted(&mut self, field: HeaderField) {
        self.table.insert(field);
    }

    fn encode_field(&mut self, field: &HeaderField, buf: &mut Vec<u8>) {
        let found = match StaticTable::find(&field.name, &field.value) {
            Some(Match::Full(index)) => Some(Match::Full(index)),
            by_name => self
                .table
                .find(&field.name, &field.value)
                .filter(|m| matches!(m, Match::Full(_)) || by_name.is_none())
                .or(by_name),
        };

        match found {
            Some(Match::Full(index)) => encode_integer(index, 7, 0x80, buf),
            Some(Match::Name(index)) => {
                encode_integer(index, 6, 0x40, buf);
                self.encode_string(&field.value, buf);
                self.table.insert(field.clone());
            }
            None => {
                buf.push(0x40);
                self.encode_string(&field.name, buf);
                self.encode_string(&field.value, buf);
                self.table.insert(field.clone());
            }
        }
    }

    fn encode_string(&self, data: &[u8], buf: &mut Vec<u8>) {
        if self.use_huffman {
            let len = huffman::encoded_len(data);
            if len < data.len() {
                encode_integer(len, 7, 0x80, buf);
                huffman::encode(data, buf);
                return;
            }
        }
        encode_integer(data.len(), 7, 0x00, buf);
        buf.extend_from_slice(data);
    }
}

/// Encode a prefixed integer (RFC 7541 5.1). `flags` fills the bits above the prefix.
pub fn encode_integer(value: usize, prefix_bits: u8, flags: u8, buf: &mut Vec<u8>) {
    let mask = (1usize << prefix_bits) - 1;
    if value < mask {
        buf.push(flags | value as u8);
        return;
    }
    buf.push(flags | mask as u8);
    let mut rest = value - mask;
    while rest >= 0x80 {
        buf.push((rest & 0x7f) as u8 | 0x80);
        rest >>= 7;
    }
    buf.push(rest as u8);
}

#[cfg(test)]
mod tests {
    use super::super::HpackDecoder;
    use super::*;

    #[test]
    fn test_encode_integer_rfc_examples() {
        let mut buf = Vec::new();
        encode_integer(10, 5, 0, &mut buf);
        assert_eq!(buf, [0x0a]);

        buf.clear();
        encode_integer(1337, 5, 0, &mut buf);
        assert_eq!(buf, [0x1f, 0x9a, 0x0a]);

        buf.clear();
        encode_integer(31, 5, 0x20, &mut buf);
        assert_eq!(buf, [0x3f, 0x00]);
    }

    #[test]
    fn test_encode_static_full_match() {
        let mut encoder = HpackEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&[HeaderField::new(":method", "POST")], &mut buf);
        assert_eq!(buf, [0x83]);
    }

    #[test]
    fn test_encode_reuses_dynamic_entry() {
        let mut encoder = HpackEncoder::new();
        encoder.set_huffman(false);
        let fields = [HeaderField::new("content-type", "application/grpc")];

        let mut first = Vec::new();
        encoder.encode(&fields, &mut first);
        // literal with indexing, static name index 31
        assert_eq!(first[0], 0x40 | 31);

        let mut second = Vec::new();
        encoder.encode(&fields, &mut second);
        assert_eq!(second, [0x80 | 62]);
    }

    #[test]
    fn test_encode_decode_with_huffman() {
        let fields = vec![
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", "application/grpc"),
            HeaderField::new("grpc-status", "0"),
            HeaderField::new("grpc-message", "all good"),
        ];
        let mut encoder = HpackEncoder::new();
        let mut decoder = HpackDecoder::new();
        for _ in 0..3 {
            let mut buf = Vec::new();
            encoder.encode(&fields, &mut buf);
            assert_eq!(decoder.decode(&buf).unwrap(), fields);
        }
    }

    #[test]
    fn test_peer_table_size_emits_update() {
        let mut encoder = HpackEncoder::new();
        encoder.set_peer_table_size(0);
        let mut buf = Vec::new();
        encoder.encode(&[HeaderField::new("grpc-status", "0")], &mut buf);
        assert_eq!(buf[0], 0x20);

        // nothing is inserted into a zero-sized table
        let mut again = Vec::new();
        encoder.encode(&[HeaderField::new("grpc-status", "0")], &mut again);
        assert_eq!(again, buf[1..]);
    }

    #[test]
    fn test_peer_table_size_bounded_by_cap() {
        let mut encoder = HpackEncoder::with_table_size(1024);
        assert_eq!(encoder.table_size(), 1024);
        encoder.set_peer_table_size(65536);
        assert_eq!(encoder.table_size(), 1024);
    }

    #[test]
    fn test_note_inserted_keeps_tables_in_sync() {
        let mut encoder = HpackEncoder::new();
        let mut decoder = HpackDecoder::new();

        // a literal written by hand, then mirrored into the encoder
        let literal = [0x40, 0x01, b'x', 0x01, b'y'];
        decoder.decode(&literal).unwrap();
        encoder.note_inserted(HeaderField::new("x", "y"));

        let mut buf = Vec::new();
        encoder.encode(&[HeaderField::new("x", "y")], &mut buf);
        assert_eq!(buf, [0x80 | 62]);
        assert_eq!(decoder.decode(&buf).unwrap(), vec![HeaderField::new("x", "y")]);
    }
}
