//! Per-connection property store.
//!
//! Handlers attach state to a connection (an authenticated identity, a
//! negotiated version, counters) without any external locking. Values are a
//! closed set of variants rather than arbitrary types.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Property {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Property {
    /// Boolean value, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Signed value, if this is an `Int` (or a `Uint` that fits).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Unsigned value, if this is a `Uint` (or a non-negative `Int`).
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Float value, if this is a `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if this is `Text`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Byte value, if this is `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Property {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Property {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Property {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<f64> for Property {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Property {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Property {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Property {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Concurrent key to [`Property`] map.
#[derive(Debug, Default)]
pub struct PropertyStore {
    map: DashMap<String, Property>,
}

impl PropertyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, returning the previous one.
    pub fn store(&self, key: impl Into<String>, value: impl Into<Property>) -> Option<Property> {
        self.map.insert(key.into(), value.into())
    }

    /// Load a value.
    pub fn load(&self, key: &str) -> Option<Property> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Load the existing value, or store `value` if the key is absent.
    ///
    /// Returns the value now in the store and whether it was already present.
    pub fn load_or_store(
        &self,
        key: impl Into<String>,
        value: impl Into<Property>,
    ) -> (Property, bool) {
        let mut loaded = true;
        let entry = self.map.entry(key.into()).or_insert_with(|| {
            loaded = false;
            value.into()
        });
        (entry.value().clone(), loaded)
    }

    /// Remove a value, returning it.
    pub fn delete(&self, key: &str) -> Option<Property> {
        self.map.remove(key).map(|(_, value)| value)
    }

    /// Replace the value at `key` with `new` only if it currently equals `old`.
    pub fn compare_and_swap(&self, key: &str, old: &Property, new: impl Into<Property>) -> bool {
        match self.map.get_mut(key) {
            Some(mut entry) if entry.value() == old => {
                *entry.value_mut() = new.into();
                true
            }
            _ => false,
        }
    }

    /// Visit entries until `f` returns `false`.
    ///
    /// `f` must not write to this store; entries are read-locked while visited.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Property) -> bool,
    {
        for entry in self.map.iter() {
            if !f(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
