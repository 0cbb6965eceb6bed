use chrono::{DateTime, Utc};
use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of a bucket id in raw bytes; the hex form is twice as long.
pub const ID_BYTES: usize = 10;

/// Fixed-width bucket identifier, formatted as 20 lowercase hex characters.
///
/// Parsing is strict: exactly `2 * ID_BYTES` characters drawn from
/// `[0-9a-f]`. Uppercase digits are rejected so that `parse(format(id))`
/// and `format(parse(s))` both round-trip exactly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId([u8; ID_BYTES]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
    #[error("bucket id must be {expected} hex characters, got {got}", expected = 2 * ID_BYTES)]
    Length { got: usize },
    #[error("bucket id must be lowercase hex")]
    Charset,
}

impl BucketId {
    /// First-level directory name: the hex of the id's first byte.
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Name of the metadata sidecar inside the bucket directory.
    pub fn meta_file_name(&self) -> String {
        format!("{self}.meta.json")
    }
}

impl FromStr for BucketId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * ID_BYTES {
            return Err(ParseIdError::Length { got: s.len() });
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(ParseIdError::Charset);
        }
        let mut bytes = [0u8; ID_BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseIdError::Charset)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId({self})")
    }
}

impl Serialize for BucketId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BucketId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Metadata sidecar stored as `<id>.meta.json` inside every bucket directory.
///
/// Written once at reservation time; `trash_time` only changes through an
/// explicit TTL extension.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BucketMeta {
    pub id: BucketId,
    pub trash_time: DateTime<Utc>,
}

impl BucketMeta {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.trash_time < now
    }
}
