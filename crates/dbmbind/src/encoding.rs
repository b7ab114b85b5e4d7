//! Output encodings and encoded strings.

use std::borrow::{Borrow, Cow};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Encoding tag carried by every string handed back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// Byte-transparent `ASCII-8BIT`.
    #[default]
    Binary,
    /// `UTF-8`.
    Utf8,
    /// `US-ASCII`.
    UsAscii,
    /// `ISO-8859-1`.
    Latin1,
}

impl Encoding {
    /// Canonical name of the encoding.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Binary => "ASCII-8BIT",
            Self::Utf8 => "UTF-8",
            Self::UsAscii => "US-ASCII",
            Self::Latin1 => "ISO-8859-1",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name lookup for encodings, case-insensitive and alias-aware.
#[derive(Debug, Clone)]
pub struct EncodingTable {
    by_name: HashMap<String, Encoding>,
}

impl EncodingTable {
    /// The table of every supported encoding and its aliases.
    #[must_use]
    pub fn standard() -> Self {
        let entries = [
            ("ASCII-8BIT", Encoding::Binary),
            ("BINARY", Encoding::Binary),
            ("UTF-8", Encoding::Utf8),
            ("UTF8", Encoding::Utf8),
            ("US-ASCII", Encoding::UsAscii),
            ("ASCII", Encoding::UsAscii),
            ("ISO-8859-1", Encoding::Latin1),
            ("ISO8859-1", Encoding::Latin1),
            ("LATIN1", Encoding::Latin1),
        ];
        Self {
            by_name: entries
                .into_iter()
                .map(|(name, encoding)| (name.to_owned(), encoding))
                .collect(),
        }
    }

    /// Resolve an encoding name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Encoding> {
        self.by_name.get(&name.trim().to_ascii_uppercase()).copied()
    }
}

/// A byte string tagged with an [`Encoding`].
///
/// Equality, ordering and hashing look at the bytes only, so an `RString`
/// can be looked up in maps by `&[u8]`.
#[derive(Clone, Default)]
pub struct RString {
    bytes: Vec<u8>,
    encoding: Encoding,
}

impl RString {
    /// Tag `bytes` with `encoding`.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>, encoding: Encoding) -> Self {
        Self {
            bytes: bytes.into(),
            encoding,
        }
    }

    /// A binary string.
    #[must_use]
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(bytes, Encoding::Binary)
    }

    /// The raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the raw bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The encoding tag.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Retag without touching the bytes.
    #[must_use]
    pub fn force_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the string is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the bytes are valid for the tagged encoding.
    #[must_use]
    pub fn is_valid_encoding(&self) -> bool {
        match self.encoding {
            Encoding::Binary | Encoding::Latin1 => true,
            Encoding::Utf8 => std::str::from_utf8(&self.bytes).is_ok(),
            Encoding::UsAscii => self.bytes.is_ascii(),
        }
    }

    /// Borrow as `&str` when the bytes are valid UTF-8.
    #[must_use]
    pub fn to_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Decode for display; Latin-1 maps each byte to one character.
    #[must_use]
    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        match self.encoding {
            Encoding::Latin1 => Cow::Owned(self.bytes.iter().map(|b| char::from(*b)).collect()),
            _ => String::from_utf8_lossy(&self.bytes),
        }
    }
}

impl fmt::Debug for RString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.to_string_lossy(), self.encoding)
    }
}

impl fmt::Display for RString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl PartialEq for RString {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for RString {}

impl PartialOrd for RString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl Hash for RString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl Borrow<[u8]> for RString {
    fn borrow(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsRef<[u8]> for RString {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq<str> for RString {
    fn eq(&self, other: &str) -> bool {
        self.bytes == other.as_bytes()
    }
}

impl PartialEq<&str> for RString {
    fn eq(&self, other: &&str) -> bool {
        self.bytes == other.as_bytes()
    }
}

impl PartialEq<[u8]> for RString {
    fn eq(&self, other: &[u8]) -> bool {
        self.bytes == other
    }
}

impl PartialEq<&[u8]> for RString {
    fn eq(&self, other: &&[u8]) -> bool {
        self.bytes == *other
    }
}

impl PartialEq<RString> for &str {
    fn eq(&self, other: &RString) -> bool {
        self.as_bytes() == other.bytes
    }
}
