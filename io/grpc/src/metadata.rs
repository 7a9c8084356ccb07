//! Call metadata (headers and trailers) and the `grpc-timeout` format.

use std::time::{Duration, Instant};

use http2::HeaderField;

/// An ordered metadata batch.
///
/// Keys are lowercase ASCII; order is preserved so pseudo-headers and
/// repeated keys go out the way they were added. A batch may also carry the
/// call deadline, which travels as `grpc-timeout` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
    deadline: Option<Instant>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value. Repeated keys are allowed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((key.into().to_ascii_lowercase(), value.into()));
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove every value for `key`, returning them in order.
    pub fn remove(&mut self, key: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|(k, v)| {
            if k.eq_ignore_ascii_case(key) {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Header fields in wire order: pseudo-headers first, then the rest.
    pub fn to_header_fields(&self) -> Vec<HeaderField> {
        let (pseudo, regular): (Vec<_>, Vec<_>) =
            self.entries.iter().partition(|(k, _)| k.starts_with(':'));
        pseudo
            .into_iter()
            .chain(regular)
            .map(|(k, v)| HeaderField::new(k.as_bytes(), v.as_bytes()))
            .collect()
    }

    /// Build a batch from decoded fields. Fields that are not UTF-8 are
    /// returned as the error.
    pub fn from_header_fields(fields: Vec<HeaderField>) -> Result<Self, HeaderField> {
        let mut metadata = Metadata::new();
        for field in fields {
            match (std::str::from_utf8(&field.name), std::str::from_utf8(&field.value)) {
                (Ok(name), Ok(value)) => metadata.insert(name, value),
                _ => return Err(field),
            }
        }
        Ok(metadata)
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// A `grpc-timeout` value: at most 8 digits followed by a unit
/// (`n`, `u`, `m`, `S`, `M` or `H`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    nanos: u128,
}

impl Timeout {
    const MAX_DIGITS: u128 = 99_999_999;
    const UNITS: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
        (3_600_000_000_000, 'H'),
    ];

    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: duration.as_nanos(),
        }
    }

    pub fn as_duration(&self) -> Duration {
        let secs = (self.nanos / 1_000_000_000).min(u64::MAX as u128) as u64;
        Duration::new(secs, (self.nanos % 1_000_000_000) as u32)
    }

    /// Header value using the finest unit that fits in 8 digits, rounding up
    /// so a deadline is never reported earlier than it is.
    pub fn to_header_value(self) -> String {
        for (scale, unit) in Self::UNITS {
            let value = self.nanos.div_ceil(scale);
            if value <= Self::MAX_DIGITS {
                return format!("{}{}", value, unit);
            }
        }
        format!("{}H", Self::MAX_DIGITS)
    }

    pub fn parse(value: &str) -> Option<Self> {
        let unit = value.chars().last()?;
        let digits = &value[..value.len() - unit.len_utf8()];
        if digits.is_empty() || digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let amount: u128 = digits.parse().ok()?;
        let (scale, _) = Self::UNITS.iter().find(|(_, u)| *u == unit)?;
        Some(Self {
            nanos: amount * scale,
        })
    }
}
