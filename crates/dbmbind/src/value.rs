//! Host values and their coercion to native bytes and numbers.

use std::fmt;
use std::sync::Arc;

use crate::encoding::RString;

/// A host object that is not a primitive.
///
/// Each conversion hook mirrors a method the host object may or may not
/// respond to; `None` means it does not.
pub trait HostObject: fmt::Debug + Send + Sync {
    /// Implicit string conversion.
    fn to_str(&self) -> Option<Vec<u8>> {
        None
    }

    /// Explicit string conversion.
    fn to_s(&self) -> Option<Vec<u8>> {
        None
    }

    /// Integer conversion.
    fn to_i(&self) -> Option<i64> {
        None
    }

    /// Float conversion.
    fn to_f(&self) -> Option<f64> {
        None
    }
}

/// A value passed in from the host.
#[derive(Debug, Clone, Default)]
pub enum HostValue {
    /// `nil`; means "absent" in compare-exchange positions.
    #[default]
    Nil,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// An encoded string.
    Str(RString),
    /// Any other object.
    Object(Arc<dyn HostObject>),
}

impl HostValue {
    /// Whether the value is `nil`.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Host truthiness: only `nil` and `false` are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    /// Coerce to a byte string.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Nil => Vec::new(),
            Self::Bool(true) => b"true".to_vec(),
            Self::Bool(false) => b"false".to_vec(),
            Self::Int(n) => n.to_string().into_bytes(),
            Self::Float(f) => format_float(*f).into_bytes(),
            Self::Bytes(bytes) => bytes.clone(),
            Self::Str(s) => s.as_bytes().to_vec(),
            Self::Object(obj) => obj
                .to_str()
                .or_else(|| obj.to_s())
                .unwrap_or_else(|| object_label(obj).into_bytes()),
        }
    }

    /// Coerce to a byte string, with `nil` meaning absent.
    #[must_use]
    pub fn to_optional_bytes(&self) -> Option<Vec<u8>> {
        (!self.is_nil()).then(|| self.to_bytes())
    }

    /// Coerce to a UTF-8 string, replacing invalid sequences.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }

    /// Coerce to an integer.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_i64(&self) -> i64 {
        match self {
            Self::Nil | Self::Bool(false) => 0,
            Self::Bool(true) => 1,
            Self::Int(n) => *n,
            // Saturating cast; NaN becomes zero.
            Self::Float(f) => *f as i64,
            Self::Bytes(bytes) => parse_int_prefix(bytes),
            Self::Str(s) => parse_int_prefix(s.as_bytes()),
            Self::Object(obj) => obj.to_i().unwrap_or(0),
        }
    }

    /// Coerce to a float.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_f64(&self) -> f64 {
        match self {
            Self::Nil | Self::Bool(false) => 0.0,
            Self::Bool(true) => 1.0,
            Self::Int(n) => *n as f64,
            Self::Float(f) => *f,
            Self::Bytes(bytes) => parse_float_prefix(bytes),
            Self::Str(s) => parse_float_prefix(s.as_bytes()),
            Self::Object(obj) => obj.to_f().unwrap_or(0.0),
        }
    }
}

fn object_label(obj: &Arc<dyn HostObject>) -> String {
    format!("#<Object:0x{:x}>", Arc::as_ptr(obj).cast::<()>().addr())
}

/// Shortest round-trip decimal; integral values print without a fraction.
fn format_float(value: f64) -> String {
    if value.is_nan() {
        "nan".to_owned()
    } else if value.is_infinite() {
        if value > 0.0 { "inf" } else { "-inf" }.to_owned()
    } else {
        format!("{value}")
    }
}

fn skip_spaces(text: &[u8]) -> &[u8] {
    let start = text
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(text.len());
    text.get(start..).unwrap_or_default()
}

/// Parse the leading integer of `text`; anything unparsable is zero and
/// overflow saturates.
fn parse_int_prefix(text: &[u8]) -> i64 {
    let text = skip_spaces(text);
    let (negative, digits) = match text.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, text),
    };
    let mut value: i64 = 0;
    for digit in digits.iter().take_while(|b| b.is_ascii_digit()) {
        let digit = i64::from(digit.saturating_sub(b'0'));
        value = if negative {
            value.saturating_mul(10).saturating_sub(digit)
        } else {
            value.saturating_mul(10).saturating_add(digit)
        };
    }
    value
}

/// Parse the longest leading float literal of `text`, else zero.
fn parse_float_prefix(text: &[u8]) -> f64 {
    let text = skip_spaces(text);
    let len = text
        .iter()
        .position(|b| !(b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E')))
        .unwrap_or(text.len());
    (1..=len)
        .rev()
        .find_map(|end| {
            text.get(..end)
                .and_then(|p| std::str::from_utf8(p).ok())
                .and_then(|p| p.parse::<f64>().ok())
        })
        .unwrap_or(0.0)
}

impl From<()> for HostValue {
    fn from((): ()) -> Self {
        Self::Nil
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for HostValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<usize> for HostValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::Bytes(value.into_bytes())
    }
}

impl From<&String> for HostValue {
    fn from(value: &String) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for HostValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for HostValue {
    fn from(value: &[u8; N]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<RString> for HostValue {
    fn from(value: RString) -> Self {
        Self::Str(value)
    }
}

impl From<&RString> for HostValue {
    fn from(value: &RString) -> Self {
        Self::Str(value.clone())
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Nil, Into::into)
    }
}

impl From<Arc<dyn HostObject>> for HostValue {
    fn from(value: Arc<dyn HostObject>) -> Self {
        Self::Object(value)
    }
}

pub(crate) fn bytes_of<V: Into<HostValue>>(value: V) -> Vec<u8> {
    value.into().to_bytes()
}

pub(crate) fn optional_bytes_of<V: Into<HostValue>>(value: V) -> Option<Vec<u8>> {
    value.into().to_optional_bytes()
}

pub(crate) fn keys_of<K, I>(keys: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = K>,
    K: Into<HostValue>,
{
    keys.into_iter().map(bytes_of).collect()
}

pub(crate) fn records_of<K, V, I>(records: I) -> Vec<(Vec<u8>, Vec<u8>)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<HostValue>,
    V: Into<HostValue>,
{
    records
        .into_iter()
        .map(|(key, value)| (bytes_of(key), bytes_of(value)))
        .collect()
}

pub(crate) fn optional_records_of<K, V, I>(records: I) -> Vec<(Vec<u8>, Option<Vec<u8>>)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<HostValue>,
    V: Into<HostValue>,
{
    records
        .into_iter()
        .map(|(key, value)| (bytes_of(key), optional_bytes_of(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Encoding;

    #[derive(Debug)]
    struct Plain;

    impl HostObject for Plain {}

    #[derive(Debug)]
    struct Named;

    impl HostObject for Named {
        fn to_s(&self) -> Option<Vec<u8>> {
            Some(b"named".to_vec())
        }

        fn to_i(&self) -> Option<i64> {
            Some(7)
        }
    }

    #[test]
    fn test_string_coercion() {
        assert_eq!(HostValue::Nil.to_bytes(), b"");
        assert_eq!(HostValue::from(true).to_bytes(), b"true");
        assert_eq!(HostValue::from(false).to_bytes(), b"false");
        assert_eq!(HostValue::from(-42).to_bytes(), b"-42");
        assert_eq!(HostValue::from(1.5).to_bytes(), b"1.5");
        assert_eq!(HostValue::from(3.0).to_bytes(), b"3");
        assert_eq!(HostValue::from(f64::INFINITY).to_bytes(), b"inf");
        let text = RString::new("héllo", Encoding::Utf8);
        assert_eq!(HostValue::from(&text).to_bytes(), "héllo".as_bytes());
    }

    #[test]
    fn test_object_coercion_fallbacks() {
        let named: Arc<dyn HostObject> = Arc::new(Named);
        assert_eq!(HostValue::from(named.clone()).to_bytes(), b"named");
        assert_eq!(HostValue::from(named).to_i64(), 7);

        let plain: Arc<dyn HostObject> = Arc::new(Plain);
        let label = HostValue::from(plain.clone()).to_string_lossy();
        assert!(label.starts_with("#<Object:0x"));
        assert_eq!(HostValue::from(plain).to_f64(), 0.0);
    }

    #[test]
    fn test_integer_coercion() {
        assert_eq!(HostValue::Nil.to_i64(), 0);
        assert_eq!(HostValue::from(true).to_i64(), 1);
        assert_eq!(HostValue::from(9.9).to_i64(), 9);
        assert_eq!(HostValue::from(" 12abc").to_i64(), 12);
        assert_eq!(HostValue::from("-5").to_i64(), -5);
        assert_eq!(HostValue::from("abc").to_i64(), 0);
        assert_eq!(HostValue::from("99999999999999999999").to_i64(), i64::MAX);
    }

    #[test]
    fn test_float_coercion() {
        assert_eq!(HostValue::from("2.5kg").to_f64(), 2.5);
        assert_eq!(HostValue::from("1e3").to_f64(), 1000.0);
        assert_eq!(HostValue::from("x").to_f64(), 0.0);
        assert_eq!(HostValue::from(4).to_f64(), 4.0);
    }

    #[test]
    fn test_nil_means_absent() {
        assert_eq!(optional_bytes_of(()), None);
        assert_eq!(optional_bytes_of(None::<&str>), None);
        assert_eq!(optional_bytes_of(""), Some(Vec::new()));
        assert_eq!(
            optional_records_of([("a", HostValue::Nil), ("b", HostValue::from("1"))]),
            vec![(b"a".to_vec(), None), (b"b".to_vec(), Some(b"1".to_vec()))]
        );
    }
}
