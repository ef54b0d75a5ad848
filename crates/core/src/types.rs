//! Core identifier types shared by the provisioning workflow.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Length of the silicon unique identifier in bytes.
pub const UID_LEN: usize = 12;

/// Number of hexadecimal characters in a key file name.
pub const KEY_NAME_LEN: usize = 4;

/// Hardware unique identifier of a device.
///
/// Rendered as 24 upper-case hexadecimal characters, which is also the form
/// stored in the provisioning database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid([u8; UID_LEN]);

impl Uid {
    /// Wrap raw UID bytes.
    pub const fn new(bytes: [u8; UID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a UID from a slice read off the device.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let raw: [u8; UID_LEN] = bytes.try_into().map_err(|_| {
            CoreError::InvalidUid(format!(
                "expected {} bytes, got {}",
                UID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Raw UID bytes.
    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }

    /// Upper-case hexadecimal rendering.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Uid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != UID_LEN * 2 {
            return Err(CoreError::InvalidUid(format!(
                "expected {} hex characters, got {}",
                UID_LEN * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidUid(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Uid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Validated key file name: exactly four hexadecimal characters.
///
/// The original spelling is preserved, since it is also the on-disk file
/// name. Anything else in a pool directory is not a key file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyFileName(String);

impl KeyFileName {
    /// Validate a candidate name.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        if Self::is_key_name(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(CoreError::InvalidKeyName(name.to_string()))
        }
    }

    /// Returns true if `name` matches `^[0-9A-Fa-f]{4}$`.
    pub fn is_key_name(name: &str) -> bool {
        name.len() == KEY_NAME_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<std::path::Path> for KeyFileName {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl TryFrom<String> for KeyFileName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<KeyFileName> for String {
    fn from(name: KeyFileName) -> Self {
        name.0
    }
}

impl FromStr for KeyFileName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Current Unix time in seconds.
///
/// A clock before the epoch yields 0 rather than failing a commit.
pub fn unix_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
