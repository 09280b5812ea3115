use std::collections::BTreeMap;

/// A decoded bencode value.
///
/// Dictionaries are kept in a `BTreeMap` keyed by raw bytes, so iteration
/// (and therefore encoding) always visits keys in ascending byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Byte string: <length>:<contents>
    Bytes(Vec<u8>),
    /// Integer: i<number>e
    Integer(i64),
    /// List: l<values>e
    List(Vec<BencodeValue>),
    /// Dictionary: d<key-value pairs>e
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(s) => Some(s),
            _ => None,
        }
    }

    /// Byte string interpreted as UTF-8, if it is valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up `key` if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict()?.get(key)
    }

    /// Short name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            BencodeValue::Bytes(_) => "string",
            BencodeValue::Integer(_) => "integer",
            BencodeValue::List(_) => "list",
            BencodeValue::Dict(_) => "dictionary",
        }
    }
}

impl From<i64> for BencodeValue {
    fn from(i: i64) -> Self {
        BencodeValue::Integer(i)
    }
}

impl From<&str> for BencodeValue {
    fn from(s: &str) -> Self {
        BencodeValue::Bytes(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for BencodeValue {
    fn from(b: &[u8]) -> Self {
        BencodeValue::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(b: Vec<u8>) -> Self {
        BencodeValue::Bytes(b)
    }
}

impl From<Vec<BencodeValue>> for BencodeValue {
    fn from(l: Vec<BencodeValue>) -> Self {
        BencodeValue::List(l)
    }
}

impl<K: Into<Vec<u8>>> FromIterator<(K, BencodeValue)> for BencodeValue {
    fn from_iter<I: IntoIterator<Item = (K, BencodeValue)>>(iter: I) -> Self {
        BencodeValue::Dict(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
