//! Buffer metadata: an ordered key-value map.

use crate::error::{Error, Result};
use crate::parcel::MessageParcel;
use rkyv::{Archive, Deserialize, Serialize};

/// Possible values for metadata entries.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum MetaValue {
    /// Boolean value.
    Bool(bool),
    /// 32-bit integer value.
    Int32(i32),
    /// 64-bit integer value.
    Int64(i64),
    /// Single-precision value.
    Float(f32),
    /// Double-precision value.
    Double(f64),
    /// String value.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<i32> for MetaValue {
    fn from(value: i32) -> Self {
        MetaValue::Int32(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int64(value)
    }
}

impl From<f32> for MetaValue {
    fn from(value: f32) -> Self {
        MetaValue::Float(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Double(value)
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::String(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::String(value.to_owned())
    }
}

impl From<Vec<u8>> for MetaValue {
    fn from(value: Vec<u8>) -> Self {
        MetaValue::Bytes(value)
    }
}

/// A key-value pair.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct MetaEntry {
    /// Entry name.
    pub key: String,
    /// Entry value.
    pub value: MetaValue,
}

/// Metadata carried with a buffer.
///
/// Entries keep insertion order; setting an existing key replaces its value
/// in place. Uses a Vec for rkyv compatibility; buffers carry few entries.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct Meta {
    entries: Vec<MetaEntry>,
}

impl Meta {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetaValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.entries.push(MetaEntry { key, value }),
        }
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Value for `key`.
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        let index = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(index).value)
    }

    /// Does `key` exist?
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|e| (e.key.as_str(), &e.value))
    }

    /// Boolean value of `key`, `None` if absent or of another kind.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            MetaValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// 32-bit integer value of `key`.
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.get(key)? {
            MetaValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    /// 64-bit integer value of `key`.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            MetaValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Single-precision value of `key`.
    pub fn get_f32(&self, key: &str) -> Option<f32> {
        match self.get(key)? {
            MetaValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Double-precision value of `key`.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            MetaValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// String value of `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            MetaValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// Byte value of `key`.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key)? {
            MetaValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// Append as a length-prefixed rkyv archive.
    pub fn write_to_parcel(&self, parcel: &mut MessageParcel) -> Result<()> {
        let archived = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| Error::InvalidOperation(format!("metadata serialization failed: {e}")))?;
        parcel.write_bytes(&archived);
        Ok(())
    }

    /// Read a length-prefixed rkyv archive.
    pub fn read_from_parcel(parcel: &mut MessageParcel) -> Result<Self> {
        let bytes = parcel.read_bytes()?;
        // Copy to aligned buffer for rkyv
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(&bytes);
        rkyv::from_bytes::<Meta, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::InvalidData(format!("metadata archive: {e}")))
    }
}
