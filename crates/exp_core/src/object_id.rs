//! Commit identifiers.

use crate::error::{ExpError, Result};
use git2::Oid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A 20-byte git object id naming a commit.
///
/// # Examples
///
/// ```
/// use exp_core::ObjectId;
///
/// let id = ObjectId::from_hex(&"ab".repeat(20)).unwrap();
/// assert_eq!(id.as_hex().len(), 40);
/// assert_eq!(id.short(), "abababa");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(Oid);

impl ObjectId {
    /// The length of an ObjectId as a hex string.
    pub const HEX_LEN: usize = 40;

    /// The underlying git object id.
    #[inline]
    pub fn oid(&self) -> Oid {
        self.0
    }

    /// Returns this ObjectId as a lowercase, 40 character hex string.
    pub fn as_hex(&self) -> String {
        self.0.to_string()
    }

    /// Returns the 7 character abbreviation used in messages.
    pub fn short(&self) -> String {
        let mut hex = self.as_hex();
        hex.truncate(7);
        hex
    }

    /// Parses an ObjectId from a full hex string.
    ///
    /// # Errors
    ///
    /// Returns `ExpError::InvalidHex` if the string is not valid hex
    /// or is not exactly 40 characters long.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != Self::HEX_LEN {
            return Err(ExpError::InvalidHex(format!(
                "expected {} hex chars, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| ExpError::InvalidHex(e.to_string()))?;
        Oid::from_bytes(&bytes)
            .map(Self)
            .map_err(|e| ExpError::InvalidHex(e.message().to_string()))
    }
}

impl From<Oid> for ObjectId {
    fn from(oid: Oid) -> Self {
        Self(oid)
    }
}

impl From<ObjectId> for Oid {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({}...)", &self.as_hex()[..12])
    }
}
