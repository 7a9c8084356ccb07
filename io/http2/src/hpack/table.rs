//! HPACK static and dynamic tables (RFC 7541 Section 2.3).

use std::collections::VecDeque;

/// Per-entry overhead added to `name.len() + value.len()` (RFC 7541 4.1).
pub const ENTRY_OVERHEAD: usize = 32;

/// A decoded header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Size charged against a dynamic table or a header list limit.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// Result of looking a field up in one of the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// Name and value both match.
    Full(usize),
    /// Only the name matches.
    Name(usize),
}

/// Static table entries, 1-based on the wire.
const STATIC: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// The fixed HPACK static table.
pub struct StaticTable;

impl StaticTable {
    pub const LEN: usize = STATIC.len();

    /// Entry at wire index `index` (1..=61).
    pub fn get(index: usize) -> Option<(&'static [u8], &'static [u8])> {
        index.checked_sub(1).and_then(|i| STATIC.get(i)).copied()
    }

    /// Best match for `name: value`, as a wire index.
    pub fn find(name: &[u8], value: &[u8]) -> Option<Match> {
        let mut by_name = None;
        for (i, (n, v)) in STATIC.iter().enumerate() {
            if *n != name {
                continue;
            }
            if *v == value {
                return Some(Match::Full(i + 1));
            }
            by_name.get_or_insert(Match::Name(i + 1));
        }
        by_name
    }
}

/// The HPACK dynamic table: newest entry first, evicted from the back.
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently charged against the table.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    /// Entry at `index`, 0 being the newest.
    pub fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    /// Insert at the front. A field larger than the whole table empties it.
    pub fn insert(&mut self, field: HeaderField) {
        let size = field.size();
        if size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - size);
        self.size += size;
        self.entries.push_front(field);
    }

    /// Best match for `name: value`, as a wire index (offset past the static table).
    pub fn find(&self, name: &[u8], value: &[u8]) -> Option<Match> {
        let mut by_name = None;
        for (i, field) in self.entries.iter().enumerate() {
            if field.name != name {
                continue;
            }
            let index = StaticTable::LEN + 1 + i;
            if field.value == value {
                return Some(Match::Full(index));
            }
            by_name.get_or_insert(Match::Name(index));
        }
        by_name
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some(field) => self.size -= field.size(),
                None => break,
            }
        }
    }
}
